//! Stage 8 — final summary.
//!
//! After every item settles (or the failure budget is spent), produce a
//! user-facing summary in the user's language, backed by the aggregate
//! status counts. A summarizer failure falls back to a terse
//! deterministic report so the workflow always ends with a message.

use td_domain::error::Result;
use td_domain::event::StageId;
use td_domain::todo::TodoCounts;
use td_llm::{ChatMessage, Priority};

use super::{stage_completion, StageContext, StageOutput, StageProcessor};

pub struct SummaryStage;

#[async_trait::async_trait]
impl StageProcessor for SummaryStage {
    fn id(&self) -> StageId {
        StageId::Summary
    }

    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let Some(todo) = ctx.todo else {
            return Ok(StageOutput::Summary { text: "Nothing was executed.".into() });
        };
        let counts = todo.status_counts();

        let items: Vec<String> = todo
            .items
            .iter()
            .map(|item| {
                format!(
                    "- [{}] {} — {}",
                    item.status,
                    item.id,
                    item.action_user.as_deref().unwrap_or(&item.action)
                )
            })
            .collect();

        let prompt = format!(
            "Summarize the outcome of this workflow for the user, in the \
             language of their original request.\n\
             Original request: {}\n\
             Steps:\n{}\n\
             Totals: {} completed, {} failed, {} skipped of {} steps.\n\
             Keep it short: what was done, what failed and why it matters, \
             and any follow-up the user should consider.",
            ctx.user_message,
            items.join("\n"),
            counts.completed,
            counts.failed,
            counts.skipped,
            counts.total,
        );

        let text = match stage_completion(
            ctx,
            &ctx.config.llm.stages.summary,
            "summarizer",
            Priority::Normal,
            vec![ChatMessage::user(prompt)],
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "summarizer failed, using fallback summary");
                fallback_summary(&counts)
            }
        };

        Ok(StageOutput::Summary { text })
    }
}

fn fallback_summary(counts: &TodoCounts) -> String {
    format!(
        "Workflow finished: {} of {} steps completed, {} failed, {} skipped.",
        counts.completed, counts.total, counts.failed, counts.skipped
    )
}
