use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Allow a critical-stage failure to short-circuit later stages.
    #[serde(default = "d_true")]
    pub early_rejection: bool,
    /// Similarity at which an auto-correction is accepted.
    #[serde(default = "d_similarity")]
    pub similarity_threshold: f64,
    /// Prior failures of the same `(tool, params)` that raise a history
    /// warning.
    #[serde(default = "d_3")]
    pub history_failure_threshold: u32,
    /// Deadline for the whole pipeline; past it the item fails with
    /// `validation-timeout` diagnostics.
    #[serde(default = "d_15000")]
    pub aggregate_timeout_ms: u64,
    /// Run the second-opinion LLM stage.
    #[serde(default)]
    pub semantic_enabled: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            early_rejection: true,
            similarity_threshold: 0.8,
            history_failure_threshold: 3,
            aggregate_timeout_ms: 15_000,
            semantic_enabled: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool history
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Ring buffer capacity.
    #[serde(default = "d_1000")]
    pub max_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_size: 1000 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inspector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectorConfig {
    /// Identical calls allowed in direct succession.
    #[serde(default = "d_3")]
    pub max_consecutive: u32,
    /// Identical calls allowed within one session.
    #[serde(default = "d_10")]
    pub max_total: u32,
    /// Patterns that deny a call outright.
    #[serde(default = "d_deny_patterns")]
    pub deny_patterns: Vec<String>,
    /// Patterns that require human approval before dispatch.
    #[serde(default = "d_approval_patterns")]
    pub approval_patterns: Vec<String>,
    /// Path prefixes writes are allowed under in task mode.
    #[serde(default = "d_write_prefixes")]
    pub allowed_write_prefixes: Vec<String>,
    /// Path prefixes writes are allowed under in dev mode (the
    /// orchestrator's own tree).
    #[serde(default = "d_dev_prefixes")]
    pub dev_write_prefixes: Vec<String>,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            max_consecutive: 3,
            max_total: 10,
            deny_patterns: d_deny_patterns(),
            approval_patterns: d_approval_patterns(),
            allowed_write_prefixes: d_write_prefixes(),
            dev_write_prefixes: d_dev_prefixes(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Verification decision rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thresholds and keyword list for the verification decision. The match
/// keywords are tuned empirically and localized; they live in config so
/// operators can extend them without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Accept when `verified` and confidence reaches this value (0–100).
    #[serde(default = "d_60f")]
    pub accept_confidence: f32,
    /// Apply the keyword override when `!verified` but confidence reaches
    /// this value and the reasoning contains a match keyword.
    #[serde(default = "d_80f")]
    pub override_confidence: f32,
    /// Also apply the keyword override below this confidence: a model
    /// that is unsure of its own `false` while the prose describes a
    /// match is the same failure mode.
    #[serde(default = "d_50f")]
    pub override_low_confidence: f32,
    /// Confidence (0–1) at which the routing model overrides the
    /// data-vs-visual heuristic.
    #[serde(default = "d_route")]
    pub route_confidence: f32,
    #[serde(default = "d_match_keywords")]
    pub match_keywords: Vec<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            accept_confidence: 60.0,
            override_confidence: 80.0,
            override_low_confidence: 50.0,
            route_confidence: 0.7,
            match_keywords: d_match_keywords(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_3() -> u32 {
    3
}
fn d_10() -> u32 {
    10
}
fn d_1000() -> usize {
    1000
}
fn d_similarity() -> f64 {
    0.8
}
fn d_15000() -> u64 {
    15_000
}
fn d_60f() -> f32 {
    60.0
}
fn d_80f() -> f32 {
    80.0
}
fn d_50f() -> f32 {
    50.0
}
fn d_route() -> f32 {
    0.7
}

fn d_match_keywords() -> Vec<String> {
    ["matches", "correct", "updated", "відповід", "успішно"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn d_deny_patterns() -> Vec<String> {
    [
        r"rm\s+(-[a-z]*[rf][a-z]*\s+)+(/|~)",
        r"mkfs\.",
        r"dd\s+if=.*of=/dev/",
        r":\(\)\s*\{.*\};\s*:",
        r">\s*/dev/s[dr][a-z]",
        r"chmod\s+-R\s+0?777\s+/",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn d_approval_patterns() -> Vec<String> {
    [r"sudo\s", r"rm\s+-[a-z]*r", r"git\s+push\s+.*--force", r"curl\s+.*\|\s*(ba)?sh"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn d_write_prefixes() -> Vec<String> {
    vec!["/tmp".into(), "./workspace".into()]
}

fn d_dev_prefixes() -> Vec<String> {
    vec!["./logs".into(), "./config".into()]
}
