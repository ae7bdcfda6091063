//! The nine workflow stage processors.
//!
//! Every stage is a stateless value behind one interface: the executor
//! owns all mutable state and hands each stage an immutable context
//! snapshot. Stages never call each other.

mod adjust;
mod execute;
mod mode;
mod plan;
mod replan;
mod select;
mod summary;
mod tool_plan;
mod verify;

pub use adjust::{AdjustEdit, AdjustStage};
pub use execute::ExecuteStage;
pub use mode::ModeStage;
pub use plan::PlanStage;
pub use replan::ReplanStage;
pub use select::SelectStage;
pub use summary::SummaryStage;
pub use tool_plan::ToolPlanStage;
pub use verify::VerifyStage;

use std::time::Duration;

use serde_json::Value;

use td_domain::cancel::CancelToken;
use td_domain::config::{Config, Mode, StageModel};
use td_domain::error::Result;
use td_domain::event::StageId;
use td_domain::todo::{Item, ItemDraft, Todo};
use td_domain::tool::{ExecutionRecord, ToolCall, Verification};
use td_llm::{ChatMessage, CompletionRequest, LlmGateway, Priority};
use td_pipeline::{Inspector, ToolHistory, ValidationPipeline};
use td_provider_host::ProviderManager;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context & output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Asks the human for permission to run a gated batch. Implemented by
/// the executor against the approval store and the event stream.
#[async_trait::async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Resolves `false` on deny, timeout, or cancellation.
    async fn request(&self, session_id: &str, reason: &str, calls: &[ToolCall]) -> bool;
}

/// Immutable snapshot handed to a stage.
pub struct StageContext<'a> {
    pub session_id: &'a str,
    pub user_message: &'a str,
    pub mode: Mode,
    pub cancel: &'a CancelToken,
    pub todo: Option<&'a Todo>,
    pub item: Option<&'a Item>,
    pub config: &'a Config,
    pub gateway: &'a LlmGateway,
    pub providers: &'a ProviderManager,
    pub pipeline: &'a ValidationPipeline,
    pub history: &'a ToolHistory,
    pub inspector: &'a Inspector,
    pub approval: &'a dyn ApprovalGate,
}

impl StageContext<'_> {
    /// The current item; stages that require one treat its absence as an
    /// internal error.
    pub fn require_item(&self) -> Result<&Item> {
        self.item
            .ok_or_else(|| td_domain::error::Error::Internal("stage requires an item".into()))
    }
}

/// What a stage hands back to the executor.
#[derive(Debug)]
pub enum StageOutput {
    Mode {
        mode: Mode,
        confidence: f32,
        /// The chat reply, when the router short-circuits to chat.
        reply: Option<String>,
    },
    Plan {
        todo: Todo,
    },
    Selection {
        providers: Vec<String>,
    },
    ToolPlan {
        calls: Vec<ToolCall>,
        warnings: Vec<String>,
    },
    Execution {
        records: Vec<ExecutionRecord>,
    },
    Verdict {
        accepted: bool,
        verification: Verification,
    },
    Adjustment {
        edit: AdjustEdit,
    },
    Replan {
        children: Vec<ItemDraft>,
    },
    Summary {
        text: String,
    },
}

/// One interface for all nine stages; the executor sequences them.
#[async_trait::async_trait]
pub trait StageProcessor: Send + Sync {
    fn id(&self) -> StageId;
    async fn process(&self, ctx: &StageContext<'_>) -> Result<StageOutput>;
}

/// The full stage set, constructed once at bootstrap.
pub struct Stages {
    pub mode: Box<dyn StageProcessor>,
    pub plan: Box<dyn StageProcessor>,
    pub select: Box<dyn StageProcessor>,
    pub tool_plan: Box<dyn StageProcessor>,
    pub execute: Box<dyn StageProcessor>,
    pub verify: Box<dyn StageProcessor>,
    pub adjust: Box<dyn StageProcessor>,
    pub replan: Box<dyn StageProcessor>,
    pub summary: Box<dyn StageProcessor>,
}

impl Stages {
    pub fn new() -> Self {
        Self {
            mode: Box::new(ModeStage),
            plan: Box::new(PlanStage),
            select: Box::new(SelectStage),
            tool_plan: Box::new(ToolPlanStage),
            execute: Box::new(ExecuteStage),
            verify: Box::new(VerifyStage),
            adjust: Box::new(AdjustStage),
            replan: Box::new(ReplanStage),
            summary: Box::new(SummaryStage),
        }
    }
}

impl Default for Stages {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Default completion size for stage calls.
const STAGE_MAX_TOKENS: u32 = 4096;

/// Run a completion for a stage through the gateway, honouring the
/// stage's model, temperature, and deadline.
pub(crate) async fn stage_completion(
    ctx: &StageContext<'_>,
    stage: &StageModel,
    service: &str,
    priority: Priority,
    messages: Vec<ChatMessage>,
) -> Result<String> {
    let timeout = Duration::from_millis(ctx.config.llm.timeout_for(stage));
    let req = CompletionRequest {
        model: stage.model.clone(),
        temperature: stage.temperature,
        max_tokens: STAGE_MAX_TOKENS,
        messages,
    };
    ctx.gateway
        .complete(service, req, priority, timeout, ctx.cancel)
        .await
}

/// Pull the first JSON value out of a model reply: the raw text, a fenced
/// code block, or the outermost braces/brackets.
pub(crate) fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // Fenced block, with or without a language tag.
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = rest.find("```") {
            if let Ok(value) = serde_json::from_str(rest[..end].trim()) {
                return Some(value);
            }
        }
    }

    // Outermost object or array.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Bound a blob of tool output for prompt inclusion.
pub(crate) fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}… [truncated]")
}
