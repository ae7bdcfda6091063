//! Stage 6 — adjust.
//!
//! Asks for a *minimal* edit to a failing item: tweak its action or
//! success criteria, or insert up to three child steps after it. The
//! executor applies the edit and re-runs the item from tool planning.

use serde::Deserialize;

use td_domain::error::{Error, Result};
use td_domain::event::StageId;
use td_domain::todo::ItemDraft;
use td_llm::{ChatMessage, Priority};

use super::{extract_json, stage_completion, truncate_for_prompt, StageContext, StageOutput, StageProcessor};

const MAX_ADJUST_CHILDREN: usize = 3;

pub struct AdjustStage;

/// The minimal edit the adjuster may propose.
#[derive(Debug)]
pub enum AdjustEdit {
    Modify {
        action: Option<String>,
        success_criteria: Option<String>,
    },
    InsertChildren { children: Vec<ItemDraft> },
}

#[derive(Debug, Deserialize)]
struct AdjustDoc {
    #[serde(default)]
    modify: Option<ModifyDoc>,
    #[serde(default)]
    children: Vec<ItemDraft>,
}

#[derive(Debug, Deserialize)]
struct ModifyDoc {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    success_criteria: Option<String>,
}

#[async_trait::async_trait]
impl StageProcessor for AdjustStage {
    fn id(&self) -> StageId {
        StageId::Adjust
    }

    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let item = ctx.require_item()?;

        let failure = item
            .verification
            .as_ref()
            .map(|v| v.reasoning.clone())
            .unwrap_or_else(|| "planning failed before execution".into());
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
            "A workflow step failed and needs a MINIMAL adjustment.\n\
             Step: {}\n\
             Success criteria: {}\n\
             What went wrong: {}\n\
             Execution results:\n{}\n\n\
             Propose ONE of:\n\
             - a small rewording: {{\"modify\": {{\"action\": \"...\", \"success_criteria\": \"...\"}}}}\n\
             - 1-3 child steps to run after it: {{\"children\": [{{\"action\", \"success_criteria\"}}]}}\n\
             Reply with JSON only.",
            item.action,
            item.success_criteria,
            failure,
            results.join("\n"),
        );

        let reply = stage_completion(
            ctx,
            &ctx.config.llm.stages.adjust,
            "adjuster",
            Priority::Normal,
            vec![ChatMessage::user(prompt)],
        )
        .await?;

        let edit = parse_adjust(&reply)?;
        Ok(StageOutput::Adjustment { edit })
    }
}

fn parse_adjust(reply: &str) -> Result<AdjustEdit> {
    let value = extract_json(reply)
        .ok_or_else(|| Error::Internal("adjust reply contains no JSON".into()))?;
    let doc: AdjustDoc = serde_json::from_value(value)
        .map_err(|e| Error::Internal(format!("unexpected adjust shape: {e}")))?;

    if let Some(modify) = doc.modify {
        if modify.action.is_none() && modify.success_criteria.is_none() {
            return Err(Error::Internal("adjust modify is empty".into()));
        }
        return Ok(AdjustEdit::Modify {
            action: modify.action,
            success_criteria: modify.success_criteria,
        });
    }
    if !doc.children.is_empty() {
        let mut children = doc.children;
        children.truncate(MAX_ADJUST_CHILDREN);
        return Ok(AdjustEdit::InsertChildren { children });
    }
    Err(Error::Internal("adjust proposed neither a modify nor children".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modify() {
        let edit = parse_adjust(
            r#"{"modify": {"action": "Read /tmp/x with absolute path", "success_criteria": null}}"#,
        )
        .unwrap();
        match edit {
            AdjustEdit::Modify { action, success_criteria } => {
                assert!(action.unwrap().contains("absolute"));
                assert!(success_criteria.is_none());
            }
            _ => panic!("expected Modify"),
        }
    }

    #[test]
    fn parses_children_and_caps_at_three() {
        let edit = parse_adjust(
            r#"{"children": [
                {"action": "a", "success_criteria": "c"},
                {"action": "b", "success_criteria": "c"},
                {"action": "c", "success_criteria": "c"},
                {"action": "d", "success_criteria": "c"}
            ]}"#,
        )
        .unwrap();
        match edit {
            AdjustEdit::InsertChildren { children } => assert_eq!(children.len(), 3),
            _ => panic!("expected InsertChildren"),
        }
    }

    #[test]
    fn empty_edit_is_an_error() {
        assert!(parse_adjust(r#"{"modify": {}}"#).is_err());
        assert!(parse_adjust(r#"{}"#).is_err());
        assert!(parse_adjust("no json").is_err());
    }
}
