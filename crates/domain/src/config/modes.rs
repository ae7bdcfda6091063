use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Modes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The overall control path for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Plain conversation; the raw LLM reply streams back.
    Chat,
    /// Full staged workflow.
    Task,
    /// Privileged self-analysis; requires the access code.
    Dev,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Chat => "chat",
            Mode::Task => "task",
            Mode::Dev => "dev",
        };
        f.write_str(s)
    }
}

/// Mode routing configuration: the privileged access code plus
/// deterministic keyword overlays applied on top of the classifier.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModeConfig {
    /// Token that enables `dev` mode; compared in constant time. When
    /// unset, dev mode is unreachable.
    #[serde(default)]
    pub access_code: Option<String>,
    /// Keyword overlays per locale; a match forces the given mode.
    #[serde(default)]
    pub keyword_overlays: Vec<KeywordOverlay>,
}

/// One deterministic keyword rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordOverlay {
    /// BCP-47-ish locale tag the keywords belong to (informational).
    #[serde(default)]
    pub locale: String,
    pub mode: Mode,
    pub keywords: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions & speech
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a session is evicted.
    #[serde(default = "d_idle")]
    pub idle_timeout_ms: u64,
    /// Sweeper wakeup interval.
    #[serde(default = "d_sweep")]
    pub sweep_interval_ms: u64,
    /// How long a `require_approval` prompt waits before downgrading to
    /// deny.
    #[serde(default = "d_approval")]
    pub approval_timeout_ms: u64,
    /// Stalled-send window after which backpressure shedding starts.
    #[serde(default = "d_stall")]
    pub send_stall_ms: u64,
    /// Per-subscriber channel capacity.
    #[serde(default = "d_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 1_800_000,
            sweep_interval_ms: 60_000,
            approval_timeout_ms: 60_000,
            send_stall_ms: 5_000,
            subscriber_buffer: 256,
        }
    }
}

/// Speech synthesis settings for the TTS fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_voice")]
    pub voice: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            voice: "default".into(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_voice() -> String {
    "default".into()
}
fn d_idle() -> u64 {
    1_800_000
}
fn d_sweep() -> u64 {
    60_000
}
fn d_approval() -> u64 {
    60_000
}
fn d_stall() -> u64 {
    5_000
}
fn d_buffer() -> usize {
    256
}
