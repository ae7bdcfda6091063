//! Stage 7 — replan.
//!
//! A deep rewrite for an item that adjustment could not save: a fresh
//! set of child steps replaces the failing item. The executor inserts
//! them, marks the parent `replanned`, and lets dependency substitution
//! unblock any dependents.

use serde::Deserialize;

use td_domain::error::{Error, Result};
use td_domain::event::StageId;
use td_domain::todo::ItemDraft;
use td_llm::{ChatMessage, Priority};

use super::{extract_json, stage_completion, truncate_for_prompt, StageContext, StageOutput, StageProcessor};

const MAX_REPLAN_CHILDREN: usize = 5;

pub struct ReplanStage;

#[derive(Debug, Deserialize)]
struct ReplanDoc {
    children: Vec<ItemDraft>,
}

#[async_trait::async_trait]
impl StageProcessor for ReplanStage {
    fn id(&self) -> StageId {
        StageId::Replan
    }

    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let item = ctx.require_item()?;

        let verification = item
            .verification
            .as_ref()
            .map(|v| format!("verified={}, confidence={}, {}", v.verified, v.confidence, v.reasoning))
            .unwrap_or_else(|| "no verification; planning or execution failed".into());
        let results: Vec<String> = item
            .execution_results
            .iter()
            .map(|r| {
                format!(
                    "- {} ({}): {}",
                    r.call.tool,
                    if r.is_error { "error" } else { "ok" },
                    truncate_for_prompt(&r.output, 400)
                )
            })
            .collect();

        let prompt = format!(
            "A workflow step failed repeatedly and must be replaced by a \
             fresh approach.\n\
             Failing step: {}\n\
             Success criteria: {}\n\
             Attempts so far: {} (adjusted {} times)\n\
             Last verdict: {}\n\
             Execution results:\n{}\n\n\
             Break the goal into 1-{MAX_REPLAN_CHILDREN} new child steps that together achieve it. \
             A child may depend on an earlier sibling via its 1-based ordinal.\n\
             Reply with JSON only: {{\"children\": [{{\"action\", \"success_criteria\", \
             \"depends_on\": [1]}}]}}",
            item.action,
            item.success_criteria,
            item.attempt_count,
            item.attempt_count,
            verification,
            results.join("\n"),
        );

        let reply = stage_completion(
            ctx,
            &ctx.config.llm.stages.replan,
            "replanner",
            Priority::Normal,
            vec![ChatMessage::user(prompt)],
        )
        .await?;

        let children = parse_replan(&reply)?;
        Ok(StageOutput::Replan { children })
    }
}

fn parse_replan(reply: &str) -> Result<Vec<ItemDraft>> {
    let value = extract_json(reply)
        .ok_or_else(|| Error::PlanInvalid("replan reply contains no JSON".into()))?;
    let doc: ReplanDoc = serde_json::from_value(value)
        .map_err(|e| Error::PlanInvalid(format!("unexpected replan shape: {e}")))?;
    if doc.children.is_empty() {
        return Err(Error::PlanInvalid("replan produced no children".into()));
    }
    let mut children = doc.children;
    children.truncate(MAX_REPLAN_CHILDREN);
    Ok(children)
}
