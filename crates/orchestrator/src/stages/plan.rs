//! Stage 1 — TODO planning.
//!
//! The planner emits a JSON TODO; the processor validates it (unique
//! hierarchical ids, backward-only dependencies in array order) and
//! retries with the validation diagnostics folded into the prompt.

use serde::Deserialize;

use td_domain::error::{Error, Result};
use td_domain::event::StageId;
use td_domain::todo::{Item, ItemId, Todo};
use td_llm::{ChatMessage, Priority};

use super::{extract_json, stage_completion, StageContext, StageOutput, StageProcessor};
use crate::dev;

const PLAN_ATTEMPTS: u32 = 3;

pub struct PlanStage;

#[derive(Debug, Deserialize)]
struct PlanDoc {
    items: Vec<PlanItem>,
}

#[derive(Debug, Deserialize)]
struct PlanItem {
    id: String,
    action: String,
    #[serde(default)]
    action_user: Option<String>,
    success_criteria: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[async_trait::async_trait]
impl StageProcessor for PlanStage {
    fn id(&self) -> StageId {
        StageId::Plan
    }

    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let mut diagnostics: Option<String> = None;

        for attempt in 1..=PLAN_ATTEMPTS {
            ctx.cancel.ensure_active()?;

            let prompt = build_prompt(ctx, diagnostics.as_deref());
            let reply = stage_completion(
                ctx,
                &ctx.config.llm.stages.plan,
                "planner",
                Priority::Normal,
                vec![ChatMessage::user(prompt)],
            )
            .await?;

            match parse_plan(&reply).and_then(|items| Todo::new(ctx.user_message, items)) {
                Ok(todo) => return Ok(StageOutput::Plan { todo }),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "plan rejected");
                    diagnostics = Some(e.to_string());
                }
            }
        }

        Err(Error::PlanInvalid(format!(
            "planner produced no valid TODO after {PLAN_ATTEMPTS} attempts: {}",
            diagnostics.unwrap_or_default()
        )))
    }
}

fn build_prompt(ctx: &StageContext<'_>, diagnostics: Option<&str>) -> String {
    let base = if ctx.mode == td_domain::config::Mode::Dev {
        dev::analysis_prompt(ctx.config, ctx.user_message)
    } else {
        let providers: Vec<String> = ctx
            .config
            .providers
            .registry
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(name, s)| format!("- {name}: {}", s.description))
            .collect();
        format!(
            "Break the user request into a TODO of concrete steps.\n\
             Available capability providers:\n{}\n\n\
             Rules:\n\
             - ids are strings \"1\", \"2\", … in order\n\
             - each item has a short imperative \"action\" (English), an optional \
               \"action_user\" in the user's language, and a verifiable \"success_criteria\"\n\
             - \"dependencies\" may reference only earlier item ids\n\
             Reply with JSON only: {{\"items\": [{{\"id\", \"action\", \"action_user\", \
             \"success_criteria\", \"dependencies\"}}]}}\n\n\
             User request: {}",
            providers.join("\n"),
            ctx.user_message
        )
    };

    match diagnostics {
        Some(problems) => format!(
            "{base}\n\nYour previous plan was rejected:\n{problems}\nEmit a corrected plan."
        ),
        None => base,
    }
}

/// Parse and structurally check the planner's reply.
fn parse_plan(reply: &str) -> Result<Vec<Item>> {
    let value =
        extract_json(reply).ok_or_else(|| Error::PlanInvalid("reply contains no JSON".into()))?;
    let doc: PlanDoc = serde_json::from_value(value)
        .map_err(|e| Error::PlanInvalid(format!("unexpected plan shape: {e}")))?;
    if doc.items.is_empty() {
        return Err(Error::PlanInvalid("plan has no items".into()));
    }

    // Top-level ids must be monotone in array order.
    let mut last_top = 0u64;
    for item in &doc.items {
        let id = ItemId::new(item.id.clone());
        if !id.as_str().contains('.') {
            let n = id
                .last_component()
                .ok_or_else(|| Error::PlanInvalid(format!("malformed id '{}'", item.id)))?;
            if n <= last_top {
                return Err(Error::PlanInvalid(format!(
                    "top-level ids must increase; '{}' follows '{last_top}'",
                    item.id
                )));
            }
            last_top = n;
        }
    }

    Ok(doc
        .items
        .into_iter()
        .map(|p| {
            let mut item = Item::new(ItemId::new(p.id), p.action, p.success_criteria)
                .with_dependencies(p.dependencies.into_iter().map(ItemId::new).collect());
            item.action_user = p.action_user;
            item
        })
        .collect())
}
