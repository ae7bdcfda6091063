//! The five validation stages.
//!
//! Each stage examines one tool call and returns pass/corrected/fail plus
//! diagnostics. Corrections compound: a stage always sees the working
//! call as corrected by the stages before it.

use std::sync::Arc;

use td_provider_host::registry::{normalize_action, similarity};
use td_provider_host::ToolRegistry;

use td_domain::tool::{canonical_name, split_canonical, ToolCall};

use crate::history::{params_hash, ToolHistory};

/// Outcome of one stage run.
#[derive(Debug)]
pub(super) struct StageResult {
    pub outcome: Outcome,
    pub diagnostics: Vec<String>,
    pub corrected_call: Option<ToolCall>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Outcome {
    Pass,
    Corrected,
    Fail,
}

impl StageResult {
    fn pass() -> Self {
        Self {
            outcome: Outcome::Pass,
            diagnostics: Vec::new(),
            corrected_call: None,
        }
    }

    fn pass_with(diag: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Pass,
            diagnostics: vec![diag.into()],
            corrected_call: None,
        }
    }

    fn corrected(call: ToolCall, diag: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Corrected,
            diagnostics: vec![diag.into()],
            corrected_call: Some(call),
        }
    }

    fn fail(diagnostics: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Fail,
            diagnostics,
            corrected_call: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 1 — Format (critical)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Structural shape: required fields present, parameters is an object,
/// tool in canonical `provider__action` form. Trivial shape problems are
/// corrected rather than failed.
pub(super) fn format(call: &ToolCall) -> StageResult {
    let mut problems = Vec::new();
    if call.provider.trim().is_empty() {
        problems.push("missing provider".to_string());
    }
    if call.tool.trim().is_empty() {
        problems.push("missing tool name".to_string());
    }
    if !call.parameters.is_object() {
        problems.push("parameters must be a JSON object".to_string());
    }
    if !problems.is_empty() {
        return StageResult::fail(problems);
    }

    match split_canonical(&call.tool) {
        Some((tool_provider, _)) if tool_provider == call.provider => StageResult::pass(),
        Some((tool_provider, _)) => {
            // The canonical name wins over a stale provider field.
            let mut fixed = call.clone();
            fixed.provider = tool_provider.to_string();
            StageResult::corrected(
                fixed,
                format!(
                    "provider field '{}' did not match tool prefix '{tool_provider}'",
                    call.provider
                ),
            )
        }
        None => {
            let mut fixed = call.clone();
            fixed.tool = canonical_name(&call.provider, &normalize_action(&call.tool));
            StageResult::corrected(
                fixed.clone(),
                format!("tool '{}' rewritten to canonical '{}'", call.tool, fixed.tool),
            )
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 2 — History (non-critical)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Warn when this exact call shape has failed repeatedly.
pub(super) fn history(history: &Arc<ToolHistory>, threshold: u32, call: &ToolCall) -> StageResult {
    let failures = history.failure_count(&call.tool, &params_hash(&call.parameters));
    if failures >= threshold as usize {
        StageResult::fail(vec![format!(
            "this exact call failed {failures} times recently; reconsider the parameters"
        )])
    } else {
        StageResult::pass()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 3 — Schema (critical)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate parameters against the provider's advertised schema, first
/// auto-correcting parameter keys by similarity to the schema's known
/// keys.
pub(super) fn schema(registry: &Arc<ToolRegistry>, threshold: f64, call: &ToolCall) -> StageResult {
    let Some(def) = registry.get(&call.tool) else {
        return StageResult::pass_with(format!(
            "'{}' is not in the registry; schema validation skipped",
            call.tool
        ));
    };

    let mut working = call.clone();
    let mut diagnostics = Vec::new();
    let mut corrected = false;

    // Key auto-correction against the schema's declared properties.
    if let Some(known) = def.input_schema.get("properties").and_then(|p| p.as_object()) {
        let known_keys: Vec<&String> = known.keys().collect();
        let params = working.parameters.as_object().cloned().unwrap_or_default();
        let mut fixed = serde_json::Map::new();
        for (key, value) in params {
            if known.contains_key(&key) {
                fixed.insert(key, value);
                continue;
            }
            let best = known_keys
                .iter()
                .map(|k| (k.as_str(), similarity(&key, k)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            match best {
                Some((known_key, score)) if score >= threshold && !fixed.contains_key(known_key) => {
                    diagnostics.push(format!(
                        "corrected parameter '{key}' to '{known_key}' (similarity {score:.2})"
                    ));
                    fixed.insert(known_key.to_string(), value);
                    corrected = true;
                }
                _ => {
                    fixed.insert(key, value);
                }
            }
        }
        working.parameters = serde_json::Value::Object(fixed);
    }

    // Full schema validation on the (possibly corrected) parameters.
    // A schema that does not compile is skipped rather than blocking.
    match jsonschema::validator_for(&def.input_schema) {
        Ok(validator) => {
            let errors: Vec<String> = validator
                .iter_errors(&working.parameters)
                .map(|e| e.to_string())
                .collect();
            if !errors.is_empty() {
                diagnostics.extend(errors);
                return StageResult::fail(diagnostics);
            }
        }
        Err(e) => diagnostics.push(format!("advertised schema does not compile: {e}")),
    }

    if corrected {
        StageResult {
            outcome: Outcome::Corrected,
            diagnostics,
            corrected_call: Some(working),
        }
    } else {
        StageResult {
            outcome: Outcome::Pass,
            diagnostics,
            corrected_call: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 4 — Provider-Sync (critical)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Confirm the tool exists in the provider's currently advertised list;
/// rewrite to the nearest canonical tool of the same provider when close
/// enough.
pub(super) fn provider_sync(
    registry: &Arc<ToolRegistry>,
    threshold: f64,
    call: &ToolCall,
) -> StageResult {
    if registry.get(&call.tool).is_some() {
        return StageResult::pass();
    }

    let Some((provider, action)) = split_canonical(&call.tool) else {
        return StageResult::fail(vec![format!("'{}' is not a canonical tool name", call.tool)]);
    };

    match registry.find_similar_in_provider(provider, action, threshold) {
        Some((def, score)) => {
            let mut fixed = call.clone();
            fixed.tool = def.name.clone();
            fixed.provider = def.provider.clone();
            StageResult::corrected(
                fixed,
                format!(
                    "'{}' is not advertised; rewritten to '{}' (similarity {score:.2})",
                    call.tool, def.name
                ),
            )
        }
        None => StageResult::fail(vec![format!(
            "'{}' is not advertised by provider '{provider}' and no close match exists",
            call.tool
        )]),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage 5 — Semantic (non-critical)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Optional second LLM opinion. Only ever produces warnings; a reviewer
/// failure never blocks the call.
pub(super) async fn semantic(
    reviewer: &dyn super::SemanticReviewer,
    call: &ToolCall,
    action: &str,
) -> StageResult {
    match reviewer.review(call, action).await {
        Ok(Some(warning)) => StageResult::fail(vec![warning]),
        Ok(None) => StageResult::pass(),
        Err(e) => StageResult::pass_with(format!("semantic review unavailable: {e}")),
    }
}
