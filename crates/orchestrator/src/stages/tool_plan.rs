//! Stage 3 — tool planning.
//!
//! Low-temperature planning of the item's tool-call sequence, validated
//! through the pipeline. Validation diagnostics are folded into the next
//! attempt's prompt; corrections from the pipeline are adopted silently.

use serde::Deserialize;
use serde_json::Value;

use td_domain::error::{Error, Result};
use td_domain::event::StageId;
use td_domain::tool::ToolCall;
use td_llm::{ChatMessage, Priority};
use td_pipeline::ValidationReport;

use super::{extract_json, stage_completion, truncate_for_prompt, StageContext, StageOutput, StageProcessor};

const TOOL_PLAN_ATTEMPTS: u32 = 3;
const HISTORY_TAIL: usize = 5;

pub struct ToolPlanStage;

#[derive(Debug, Deserialize)]
struct ToolPlanDoc {
    tool_calls: Vec<PlannedCall>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct PlannedCall {
    provider: String,
    tool: String,
    #[serde(default = "empty_object")]
    parameters: Value,
    #[serde(default)]
    reasoning: String,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[async_trait::async_trait]
impl StageProcessor for ToolPlanStage {
    fn id(&self) -> StageId {
        StageId::ToolPlan
    }

    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let item = ctx.require_item()?;
        let mut diagnostics: Option<String> = None;

        for attempt in 1..=TOOL_PLAN_ATTEMPTS {
            ctx.cancel.ensure_active()?;

            let prompt = build_prompt(ctx, diagnostics.as_deref());
            let reply = stage_completion(
                ctx,
                &ctx.config.llm.stages.tool_plan,
                "tool-planner",
                Priority::Normal,
                vec![ChatMessage::user(prompt)],
            )
            .await?;

            let calls = match parse_tool_plan(&reply) {
                Ok(calls) => calls,
                Err(e) => {
                    tracing::debug!(item = %item.id, attempt, error = %e, "tool plan unparseable");
                    diagnostics = Some(e.to_string());
                    continue;
                }
            };

            let reports = ctx.pipeline.validate_batch(&calls, &item.action).await?;
            if reports.iter().all(|r| r.valid) {
                let warnings = reports.iter().flat_map(|r| r.warnings()).collect();
                let calls = reports.into_iter().map(|r| r.call).collect();
                return Ok(StageOutput::ToolPlan { calls, warnings });
            }

            let problems = collect_failures(&reports);
            tracing::debug!(item = %item.id, attempt, problems = %problems, "tool plan failed validation");
            diagnostics = Some(problems);
        }

        Err(Error::ValidationFailed(format!(
            "no valid tool plan after {TOOL_PLAN_ATTEMPTS} attempts: {}",
            diagnostics.unwrap_or_default()
        )))
    }
}

fn build_prompt(ctx: &StageContext<'_>, diagnostics: Option<&str>) -> String {
    let item = ctx.item.expect("checked by process");

    let mut tool_lines = Vec::new();
    for provider in &item.selected_providers {
        for def in ctx.providers.registry().list_provider(provider) {
            let required = def
                .input_schema
                .get("required")
                .and_then(|r| r.as_array())
                .map(|r| {
                    r.iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            tool_lines.push(format!(
                "- {} — {} (required: {required})",
                def.name, def.description
            ));
        }
    }

    let history_lines: Vec<String> = ctx
        .history
        .recent(HISTORY_TAIL)
        .into_iter()
        .map(|e| format!("- {} → {:?}", e.tool, e.outcome))
        .collect();

    let mut prompt = format!(
        "Plan the tool calls for this step.\n\
         Step: {}\n\
         Success criteria: {}\n\n\
         Available tools (use these exact names):\n{}\n",
        item.action,
        item.success_criteria,
        tool_lines.join("\n"),
    );
    if !history_lines.is_empty() {
        prompt.push_str(&format!("\nRecent tool activity:\n{}\n", history_lines.join("\n")));
    }
    prompt.push_str(
        "\nReply with JSON only:\n\
         {\"tool_calls\": [{\"provider\": \"...\", \"tool\": \"provider__action\", \
         \"parameters\": {}, \"reasoning\": \"...\"}], \"reasoning\": \"...\"}",
    );
    if let Some(problems) = diagnostics {
        prompt.push_str(&format!(
            "\n\nYour previous plan was rejected:\n{}\nEmit a corrected plan.",
            truncate_for_prompt(problems, 2000)
        ));
    }
    prompt
}

fn parse_tool_plan(reply: &str) -> Result<Vec<ToolCall>> {
    let value = extract_json(reply)
        .ok_or_else(|| Error::ValidationFailed("reply contains no JSON".into()))?;
    let doc: ToolPlanDoc = serde_json::from_value(value)
        .map_err(|e| Error::ValidationFailed(format!("unexpected tool plan shape: {e}")))?;
    if doc.tool_calls.is_empty() {
        return Err(Error::ValidationFailed("tool plan is empty".into()));
    }
    Ok(doc
        .tool_calls
        .into_iter()
        .map(|c| ToolCall {
            provider: c.provider,
            tool: c.tool,
            parameters: c.parameters,
            reasoning: if c.reasoning.is_empty() {
                doc.reasoning.clone()
            } else {
                c.reasoning
            },
        })
        .collect())
}

fn collect_failures(reports: &[ValidationReport]) -> String {
    reports
        .iter()
        .filter(|r| !r.valid)
        .map(|r| r.diagnostics_text())
        .collect::<Vec<_>>()
        .join("\n")
}
