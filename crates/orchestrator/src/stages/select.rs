//! Stage 2 — provider selection.
//!
//! Picks up to two capability providers for an item. The model sees one
//! terse line per enabled provider; unparseable output falls back to the
//! configured default provider.

use td_domain::error::Result;
use td_domain::event::StageId;
use td_llm::{ChatMessage, Priority};

use super::{extract_json, stage_completion, StageContext, StageOutput, StageProcessor};

pub struct SelectStage;

#[async_trait::async_trait]
impl StageProcessor for SelectStage {
    fn id(&self) -> StageId {
        StageId::Select
    }

    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let item = ctx.require_item()?;
        let ready = ctx.providers.ready_names();

        let lines: Vec<String> = ready
            .iter()
            .map(|name| {
                let description = ctx
                    .config
                    .providers
                    .registry
                    .get(name)
                    .map(|s| s.description.as_str())
                    .unwrap_or("");
                format!("- {name}: {description}")
            })
            .collect();

        let prompt = format!(
            "Choose the capability providers needed for this step (at most two).\n\
             Providers:\n{}\n\n\
             Step: {}\n\
             Reply with JSON only: {{\"providers\": [\"name\"]}}",
            lines.join("\n"),
            item.action
        );

        let reply = stage_completion(
            ctx,
            &ctx.config.llm.stages.select,
            "selector",
            Priority::Normal,
            vec![ChatMessage::user(prompt)],
        )
        .await;

        let parsed = reply.ok().and_then(|text| parse_selection(&text));
        let providers = clamp_selection(parsed, &ready, &ctx.config.providers.default_provider);

        Ok(StageOutput::Selection { providers })
    }
}

fn parse_selection(reply: &str) -> Option<Vec<String>> {
    let value = extract_json(reply)?;
    let list = value.get("providers").unwrap_or(&value).as_array()?.clone();
    Some(
        list.into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    )
}

/// Clamp to at most two known-ready providers and guarantee at least one.
fn clamp_selection(parsed: Option<Vec<String>>, ready: &[String], default: &str) -> Vec<String> {
    let mut selected: Vec<String> = parsed
        .unwrap_or_default()
        .into_iter()
        .filter(|name| ready.iter().any(|r| r == name))
        .take(2)
        .collect();
    selected.dedup();

    if selected.is_empty() {
        if ready.iter().any(|r| r == default) {
            selected.push(default.to_string());
        } else if let Some(first) = ready.first() {
            selected.push(first.clone());
        }
    }
    selected
}
