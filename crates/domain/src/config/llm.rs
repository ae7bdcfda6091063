use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM stage models
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which model and temperature each workflow stage uses, plus the
/// default per-call deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Default per-LLM-call deadline. Individual stages may override.
    #[serde(default = "d_60000")]
    pub timeout_ms: u64,
    /// Base URL of an OpenAI-compatible chat completions API for the
    /// bundled client. Leave unset when embedding with a custom client.
    #[serde(default)]
    pub api_base: Option<String>,
    /// Environment variable holding the API key for the bundled client.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub stages: StageModels,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            api_base: None,
            api_key_env: d_api_key_env(),
            stages: StageModels::default(),
        }
    }
}

fn d_api_key_env() -> String {
    "TANDEM_API_KEY".into()
}

impl LlmConfig {
    /// Effective deadline for a stage model.
    pub fn timeout_for(&self, stage: &StageModel) -> u64 {
        stage.timeout_ms.unwrap_or(self.timeout_ms)
    }
}

/// Model + temperature for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageModel {
    pub model: String,
    pub temperature: f32,
    /// Per-stage deadline override.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl StageModel {
    fn new(model: &str, temperature: f32) -> Self {
        Self {
            model: model.into(),
            temperature,
            timeout_ms: None,
        }
    }
}

/// One entry per LLM-backed stage. The mode router is intentionally a
/// small fast model; the tool planner and verifier run cold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageModels {
    #[serde(default = "d_mode")]
    pub mode: StageModel,
    #[serde(default = "d_plan")]
    pub plan: StageModel,
    #[serde(default = "d_select")]
    pub select: StageModel,
    #[serde(default = "d_tool_plan")]
    pub tool_plan: StageModel,
    #[serde(default = "d_verify")]
    pub verify: StageModel,
    /// Vision-capable model for visual verification.
    #[serde(default = "d_verify_visual")]
    pub verify_visual: StageModel,
    #[serde(default = "d_adjust")]
    pub adjust: StageModel,
    #[serde(default = "d_replan")]
    pub replan: StageModel,
    #[serde(default = "d_summary")]
    pub summary: StageModel,
    /// Second-opinion model for the semantic validation stage.
    #[serde(default = "d_semantic")]
    pub semantic: StageModel,
    /// Plain chat replies when the mode router short-circuits.
    #[serde(default = "d_chat")]
    pub chat: StageModel,
}

impl Default for StageModels {
    fn default() -> Self {
        Self {
            mode: d_mode(),
            plan: d_plan(),
            select: d_select(),
            tool_plan: d_tool_plan(),
            verify: d_verify(),
            verify_visual: d_verify_visual(),
            adjust: d_adjust(),
            replan: d_replan(),
            summary: d_summary(),
            semantic: d_semantic(),
            chat: d_chat(),
        }
    }
}

fn d_mode() -> StageModel {
    StageModel::new("default-mini", 0.0)
}
fn d_plan() -> StageModel {
    StageModel::new("default", 0.3)
}
fn d_select() -> StageModel {
    StageModel::new("default-mini", 0.2)
}
fn d_tool_plan() -> StageModel {
    StageModel::new("default", 0.1)
}
fn d_verify() -> StageModel {
    StageModel::new("default", 0.0)
}
fn d_verify_visual() -> StageModel {
    StageModel::new("default-vision", 0.0)
}
fn d_adjust() -> StageModel {
    StageModel::new("default", 0.3)
}
fn d_replan() -> StageModel {
    StageModel::new("default", 0.4)
}
fn d_summary() -> StageModel {
    StageModel::new("default", 0.5)
}
fn d_semantic() -> StageModel {
    StageModel::new("default-mini", 0.0)
}
fn d_chat() -> StageModel {
    StageModel::new("default", 0.7)
}
fn d_60000() -> u64 {
    60_000
}
