use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability provider registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The declarative provider registry, read once at startup. Changing it
/// requires a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Fallback provider when selection output is unparseable.
    #[serde(default = "d_default_provider")]
    pub default_provider: String,
    /// Per-provider initialize handshake deadline.
    #[serde(default = "d_15000")]
    pub init_timeout_ms: u64,
    /// Per tool-call deadline.
    #[serde(default = "d_60000")]
    pub call_timeout_ms: u64,
    /// Registry keyed by provider name.
    #[serde(default)]
    pub registry: HashMap<String, ProviderSpec>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default_provider: "browser".into(),
            init_timeout_ms: 15_000,
            call_timeout_ms: 60_000,
            registry: HashMap::new(),
        }
    }
}

impl ProvidersConfig {
    /// Names of enabled providers, sorted for deterministic iteration.
    pub fn enabled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .iter()
            .filter(|(_, spec)| spec.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// One provider entry: how to spawn it and what to tell the selector
/// about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Program and arguments, `argv[0]` is the executable.
    pub argv: Vec<String>,
    /// Extra environment for the subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Terse one-line description shown to the provider-selection stage.
    #[serde(default)]
    pub description: String,
}

fn d_true() -> bool {
    true
}
fn d_default_provider() -> String {
    "browser".into()
}
fn d_15000() -> u64 {
    15_000
}
fn d_60000() -> u64 {
    60_000
}
