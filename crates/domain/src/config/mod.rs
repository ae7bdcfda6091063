//! Immutable configuration tree.
//!
//! Constructed once at startup (TOML + defaults), validated, then passed
//! by `Arc` to every component. No module-level mutable state anywhere.

mod executor;
mod limits;
mod llm;
mod modes;
mod providers;
mod server;
mod validation;

pub use executor::*;
pub use limits::*;
pub use llm::*;
pub use modes::*;
pub use providers::*;
pub use server::*;
pub use validation::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub inspector: InspectorConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

fn error(message: impl Into<String>) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Error,
        message: message.into(),
    }
}

fn warning(message: impl Into<String>) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Warning,
        message: message.into(),
    }
}

impl Config {
    /// Check the whole tree for inconsistencies. Issues at `Error`
    /// severity must abort startup (exit code 2).
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.executor.max_item_attempts == 0 {
            issues.push(error("executor.max_item_attempts must be at least 1"));
        }
        if self.executor.blocked_check_threshold_resolve
            >= self.executor.blocked_check_threshold_skip
        {
            issues.push(error(
                "executor.blocked_check_threshold_resolve must be below blocked_check_threshold_skip",
            ));
        }

        if self.rate_limit.min_delay_ms > self.rate_limit.max_delay_ms {
            issues.push(error("rate_limit.min_delay_ms exceeds rate_limit.max_delay_ms"));
        }
        if self.rate_limit.queue_cap == 0 {
            issues.push(error("rate_limit.queue_cap must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.validation.similarity_threshold) {
            issues.push(error("validation.similarity_threshold must be within 0.0..=1.0"));
        }

        if self.circuit.failure_threshold == 0 {
            issues.push(error("circuit.failure_threshold must be at least 1"));
        }

        for pattern in self
            .inspector
            .deny_patterns
            .iter()
            .chain(&self.inspector.approval_patterns)
        {
            if let Err(e) = regex::Regex::new(pattern) {
                issues.push(error(format!("inspector pattern '{pattern}' does not compile: {e}")));
            }
        }

        if let Some(code) = &self.mode.access_code {
            if code.len() < 8 {
                issues.push(warning("mode.access_code is shorter than 8 characters"));
            }
        }

        for (name, spec) in &self.providers.registry {
            if spec.enabled && spec.argv.is_empty() {
                issues.push(error(format!("provider '{name}' is enabled but has an empty argv")));
            }
        }
        if !self.providers.registry.is_empty()
            && !self.providers.registry.contains_key(&self.providers.default_provider)
        {
            issues.push(warning(format!(
                "providers.default_provider '{}' is not in the registry",
                self.providers.default_provider
            )));
        }

        if self.verification.match_keywords.is_empty() {
            issues.push(warning("verification.match_keywords is empty; the false-but-matches override is disabled"));
        }

        issues
    }

    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues.iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
