//! Shared application state passed to the API handlers and the executor.

use std::sync::Arc;

use td_domain::config::Config;
use td_llm::LlmGateway;
use td_pipeline::{Inspector, ToolHistory, ValidationPipeline};
use td_provider_host::ProviderManager;

use crate::approval::ApprovalStore;
use crate::coordinator::StreamingCoordinator;
use crate::sessions::SessionStore;
use crate::speech::SpeechService;
use crate::stages::Stages;

/// Everything the orchestrator needs, grouped by concern:
/// - **Core services** — config, LLM gateway, capability providers
/// - **Workflow** — stage set, validation pipeline, history, inspector
/// - **Sessions & streaming** — session store, coordinator, approvals, speech
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub gateway: Arc<LlmGateway>,
    pub providers: Arc<ProviderManager>,

    // ── Workflow ──────────────────────────────────────────────────────
    pub stages: Arc<Stages>,
    pub pipeline: Arc<ValidationPipeline>,
    pub history: Arc<ToolHistory>,
    pub inspector: Arc<Inspector>,

    // ── Sessions & streaming ──────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub coordinator: Arc<StreamingCoordinator>,
    pub approvals: Arc<ApprovalStore>,
    pub speech: Arc<SpeechService>,
}
