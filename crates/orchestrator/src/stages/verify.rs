//! Stage 5 — verification.
//!
//! An auxiliary routing call picks between *data* verification (judge
//! the result payloads) and *visual* verification (capture a screenshot
//! and judge the image); the routing model overrides the heuristic only
//! at sufficient confidence. The verdict decision applies the
//! false-but-matches keyword override from configuration.

use serde::Deserialize;

use td_domain::error::Result;
use td_domain::event::StageId;
use td_domain::config::VerificationConfig;
use td_domain::tool::{ExecutionRecord, Verification, VerificationMode};
use td_llm::{ChatMessage, Priority};

use super::{extract_json, stage_completion, truncate_for_prompt, StageContext, StageOutput, StageProcessor};

const RESULT_PROMPT_BUDGET: usize = 4000;

pub struct VerifyStage;

#[derive(Debug, Deserialize)]
struct RawVerdict {
    verified: bool,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    evidence: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteVerdict {
    mode: String,
    #[serde(default)]
    confidence: f32,
}

#[async_trait::async_trait]
impl StageProcessor for VerifyStage {
    fn id(&self) -> StageId {
        StageId::Verify
    }

    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let item = ctx.require_item()?;

        let mode = route(ctx).await;
        let screenshot = if mode == VerificationMode::Visual {
            capture_screenshot(ctx).await
        } else {
            None
        };
        // Visual routing without a capture tool degrades to data mode.
        let mode = if mode == VerificationMode::Visual && screenshot.is_none() {
            VerificationMode::Data
        } else {
            mode
        };

        let prompt = verdict_prompt(item.action.as_str(), &item.success_criteria, &item.execution_results, screenshot.as_deref());
        let stage_model = match mode {
            VerificationMode::Data => &ctx.config.llm.stages.verify,
            VerificationMode::Visual => &ctx.config.llm.stages.verify_visual,
        };
        let reply = stage_completion(
            ctx,
            stage_model,
            "verifier",
            Priority::Critical,
            vec![ChatMessage::user(prompt)],
        )
        .await?;

        let raw = extract_json(&reply)
            .and_then(|v| serde_json::from_value::<RawVerdict>(v).ok())
            .unwrap_or(RawVerdict {
                verified: false,
                confidence: 0.0,
                reasoning: "verifier reply was unparseable".into(),
                evidence: None,
            });

        let (accepted, verification) = decide(raw, mode, &ctx.config.verification);
        Ok(StageOutput::Verdict { accepted, verification })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Browser/GUI work verifies visually by default; everything else by
/// inspecting the data.
fn heuristic_mode(records: &[ExecutionRecord]) -> VerificationMode {
    let visual = records.iter().any(|r| {
        r.call.tool.contains("browser")
            || r.call.tool.contains("gui")
            || r.call.provider == "playwright"
    });
    if visual {
        VerificationMode::Visual
    } else {
        VerificationMode::Data
    }
}

async fn route(ctx: &StageContext<'_>) -> VerificationMode {
    let item = ctx.item.expect("checked by process");
    let heuristic = heuristic_mode(&item.execution_results);

    let prompt = format!(
        "Should this step be verified by inspecting tool output data, or \
         visually via a screenshot?\n\
         Step: {}\n\
         Tools used: {}\n\
         Reply with JSON only: {{\"mode\": \"data\"|\"visual\", \"confidence\": 0.0-1.0}}",
        item.action,
        item.execution_results
            .iter()
            .map(|r| r.call.tool.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    );

    let verdict = stage_completion(
        ctx,
        &ctx.config.llm.stages.semantic,
        "verify-router",
        Priority::Normal,
        vec![ChatMessage::user(prompt)],
    )
    .await
    .ok()
    .and_then(|text| extract_json(&text))
    .and_then(|v| serde_json::from_value::<RouteVerdict>(v).ok());

    match verdict {
        Some(v) if v.confidence >= ctx.config.verification.route_confidence => match v.mode.as_str()
        {
            "visual" => VerificationMode::Visual,
            "data" => VerificationMode::Data,
            _ => heuristic,
        },
        _ => heuristic,
    }
}

/// Fire one screenshot-capture tool call for the vision verifier.
async fn capture_screenshot(ctx: &StageContext<'_>) -> Option<String> {
    let registry = ctx.providers.registry();
    let capture = registry
        .list()
        .into_iter()
        .find(|def| def.name.contains("screenshot") || def.name.contains("capture"))?;

    match ctx
        .providers
        .call_tool(&capture.name, serde_json::json!({}), ctx.cancel)
        .await
    {
        Ok(result) if !result.is_error => Some(result.text()),
        Ok(_) | Err(_) => {
            tracing::debug!(tool = %capture.name, "screenshot capture failed, using data mode");
            None
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Verdict
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn verdict_prompt(
    action: &str,
    success_criteria: &str,
    records: &[ExecutionRecord],
    screenshot: Option<&str>,
) -> String {
    let results: Vec<String> = records
        .iter()
        .map(|r| {
            format!(
                "- {} ({}ms, {}): {}",
                r.call.tool,
                r.duration_ms,
                if r.is_error { "error" } else { "ok" },
                truncate_for_prompt(&r.output, RESULT_PROMPT_BUDGET / records.len().max(1)),
            )
        })
        .collect();

    let mut prompt = format!(
        "Judge whether this step succeeded.\n\
         Step: {action}\n\
         Success criteria: {success_criteria}\n\
         Execution results:\n{}\n",
        results.join("\n"),
    );
    if let Some(image) = screenshot {
        prompt.push_str(&format!(
            "\nScreenshot (captured after execution):\n{}\n",
            truncate_for_prompt(image, 2000)
        ));
    }
    prompt.push_str(
        "\nReply with JSON only: {\"verified\": bool, \"confidence\": 0-100, \
         \"reasoning\": \"...\", \"evidence\": \"...\"}",
    );
    prompt
}

/// Apply the acceptance rules to a raw verdict.
fn decide(
    raw: RawVerdict,
    mode: VerificationMode,
    config: &VerificationConfig,
) -> (bool, Verification) {
    let keyword_hit = {
        let reasoning = raw.reasoning.to_lowercase();
        config
            .match_keywords
            .iter()
            .any(|k| !k.is_empty() && reasoning.contains(&k.to_lowercase()))
    };

    let accepted_plain = raw.verified && raw.confidence >= config.accept_confidence;
    // Models sometimes say `verified=false` while the prose describes a
    // match; honour the prose when the keyword appears, unless the model
    // sits in the mid-confidence band where `false` looks deliberate.
    let override_applied = !raw.verified
        && keyword_hit
        && (raw.confidence >= config.override_confidence
            || raw.confidence <= config.override_low_confidence);

    let accepted = accepted_plain || override_applied;
    let verification = Verification {
        verified: accepted,
        confidence: raw.confidence,
        reasoning: raw.reasoning,
        evidence: raw.evidence,
        mode,
        override_applied,
    };
    (accepted, verification)
}
