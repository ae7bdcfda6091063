//! Workflow events.
//!
//! Every stage emits events through the streaming coordinator. Each event
//! carries the session id, a strictly increasing per-session sequence
//! number, and the logical stage it was emitted from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::todo::{ItemId, ItemStatus, ItemView};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage ids
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The nine ordered workflow stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Mode,
    Plan,
    Select,
    ToolPlan,
    Execute,
    Verify,
    Adjust,
    Replan,
    Summary,
}

impl StageId {
    pub fn as_u8(self) -> u8 {
        match self {
            StageId::Mode => 0,
            StageId::Plan => 1,
            StageId::Select => 2,
            StageId::ToolPlan => 3,
            StageId::Execute => 4,
            StageId::Verify => 5,
            StageId::Adjust => 6,
            StageId::Replan => 7,
            StageId::Summary => 8,
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageId::Mode => "mode",
            StageId::Plan => "plan",
            StageId::Select => "select",
            StageId::ToolPlan => "tool_plan",
            StageId::Execute => "execute",
            StageId::Verify => "verify",
            StageId::Adjust => "adjust",
            StageId::Replan => "replan",
            StageId::Summary => "summary",
        };
        f.write_str(s)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the workflow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Tool activity phases reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Dispatched,
    Finished,
    ApprovalRequired,
}

/// The event sum type emitted by every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Progress on the workflow or a specific item. Carries a TODO
    /// snapshot when the plan itself changed.
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<ItemId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ItemStatus>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        todo: Option<Vec<ItemView>>,
    },

    /// A chat message for the user (never shed by backpressure).
    Chat { text: String },

    /// A phrase queued for speech synthesis.
    TtsChunk { text: String },

    /// Tool activity on an item.
    Tool {
        item_id: ItemId,
        tool: String,
        phase: ToolPhase,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// The executor moved to a new stage.
    StageTransition { stage: StageId },

    /// The workflow reached a terminal state (never shed).
    Terminal {
        outcome: TerminalOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
    },
}

/// Backpressure shedding priority; lower classes are dropped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShedClass {
    /// TTS chunks: dropped first.
    Speech,
    /// Progress, tool, and stage events: dropped second.
    Progress,
    /// Chat messages and terminals: never dropped.
    Essential,
}

impl EventPayload {
    pub fn shed_class(&self) -> ShedClass {
        match self {
            EventPayload::TtsChunk { .. } => ShedClass::Speech,
            EventPayload::Progress { .. }
            | EventPayload::Tool { .. }
            | EventPayload::StageTransition { .. } => ShedClass::Progress,
            EventPayload::Chat { .. } | EventPayload::Terminal { .. } => ShedClass::Essential,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An emitted event plus its per-session ordering envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    /// Strictly increasing, contiguous per session.
    pub seq: u64,
    pub stage: StageId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(session_id: impl Into<String>, seq: u64, stage: StageId, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            seq,
            stage,
            at: Utc::now(),
            payload,
        }
    }
}
