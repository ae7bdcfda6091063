//! Tool-call types and canonical tool naming.
//!
//! Internally every tool is addressed by its canonical name
//! `provider__action` (double underscore). The provider host owns the
//! translation to whatever wire name a given provider actually accepts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between provider and action in a canonical tool name.
pub const CANONICAL_SEPARATOR: &str = "__";

/// Build the canonical form `provider__action`.
pub fn canonical_name(provider: &str, action: &str) -> String {
    format!("{provider}{CANONICAL_SEPARATOR}{action}")
}

/// Split a canonical name into `(provider, action)`.
///
/// Returns `None` when the name is not in canonical form. The action part
/// may itself contain underscores (`playwright__browser_navigate`), so the
/// split is on the **first** double underscore.
pub fn split_canonical(name: &str) -> Option<(&str, &str)> {
    let idx = name.find(CANONICAL_SEPARATOR)?;
    let provider = &name[..idx];
    let action = &name[idx + CANONICAL_SEPARATOR.len()..];
    if provider.is_empty() || action.is_empty() {
        return None;
    }
    Some((provider, action))
}

/// A single planned tool invocation, as produced by the tool-planning stage
/// and consumed by the validation pipeline and the provider host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Capability provider name (`filesystem`, `playwright`, ...).
    pub provider: String,
    /// Canonical tool name (`provider__action`).
    pub tool: String,
    /// Tool parameters; must be a JSON object.
    pub parameters: Value,
    /// The planner's stated reason for this call.
    #[serde(default)]
    pub reasoning: String,
}

impl ToolCall {
    /// Whether `tool` is in canonical form and its provider component
    /// matches the `provider` field.
    pub fn is_canonical(&self) -> bool {
        match split_canonical(&self.tool) {
            Some((provider, _)) => provider == self.provider,
            None => false,
        }
    }
}

/// A tool definition aggregated into the registry namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    /// Canonical name (`provider__action`).
    pub name: String,
    /// Owning provider.
    pub provider: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema advertised by the provider for the parameters.
    pub input_schema: Value,
}

/// The collected outcome of one executed tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub call: ToolCall,
    /// Textual output returned by the provider.
    pub output: String,
    pub is_error: bool,
    /// Diagnostic output the provider wrote to its stderr during the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub duration_ms: u64,
}

/// Verification routing chosen for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    /// Inspect the execution result payloads.
    Data,
    /// Capture a screenshot and pass it to a vision model.
    Visual,
}

/// The verifier's verdict for an item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub verified: bool,
    /// 0–100 confidence as reported by the verifier model.
    pub confidence: f32,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    pub mode: VerificationMode,
    /// Set when a `verified=false` verdict was accepted because the prose
    /// contained a configured match keyword at high confidence.
    #[serde(default)]
    pub override_applied: bool,
}
