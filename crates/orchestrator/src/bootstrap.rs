//! Server bootstrap: construct every service, wire the state, spawn the
//! background tasks, and bind the listener.

use std::sync::Arc;
use std::time::Duration;

use td_domain::config::Config;
use td_domain::error::{Error, Result};
use td_llm::{LlmClient, LlmGateway};
use td_pipeline::{Inspector, ToolHistory, ValidationPipeline};
use td_provider_host::ProviderManager;

use crate::approval::ApprovalStore;
use crate::coordinator::StreamingCoordinator;
use crate::llm_http::{HttpLlmClient, UnconfiguredLlmClient};
use crate::sessions::SessionStore;
use crate::speech::{NullSynthesizer, SpeechService, Synthesizer};
use crate::stages::Stages;
use crate::state::AppState;

/// Build the default LLM client from configuration.
pub fn default_llm_client(config: &Config) -> Arc<dyn LlmClient> {
    match &config.llm.api_base {
        Some(api_base) => {
            let api_key = std::env::var(&config.llm.api_key_env).ok();
            if api_key.is_none() {
                tracing::warn!(
                    env = %config.llm.api_key_env,
                    "LLM API key env var unset; requests will be unauthenticated"
                );
            }
            Arc::new(HttpLlmClient::new(api_base.clone(), api_key))
        }
        None => Arc::new(UnconfiguredLlmClient),
    }
}

/// Construct the full application state with injected collaborators.
/// Spawns the configured capability providers and the session sweeper.
pub async fn build_state(
    config: Arc<Config>,
    client: Arc<dyn LlmClient>,
    synthesizer: Arc<dyn Synthesizer>,
) -> Result<AppState> {
    let providers = Arc::new(ProviderManager::start(&config.providers).await);

    let history = Arc::new(ToolHistory::new(config.history.max_size));
    let pipeline = Arc::new(ValidationPipeline::new(
        config.validation.clone(),
        Arc::clone(&history),
        providers.registry(),
    ));
    let inspector = Arc::new(Inspector::new(config.inspector.clone())?);

    let gateway = Arc::new(LlmGateway::new(
        client,
        config.rate_limit.clone(),
        config.circuit.clone(),
    ));

    let sessions = Arc::new(SessionStore::new(config.session.clone()));
    let coordinator = Arc::new(StreamingCoordinator::new(
        Arc::clone(&sessions),
        config.session.clone(),
    ));
    let approvals = Arc::new(ApprovalStore::new(Duration::from_millis(
        config.session.approval_timeout_ms,
    )));
    let speech = Arc::new(SpeechService::new(synthesizer, config.speech.clone()));

    // Evicted sessions also release their inspector counters.
    let sweeper_inspector = Arc::clone(&inspector);
    let _sweeper = sessions.spawn_sweeper(Arc::new(move |session_id: &str| {
        sweeper_inspector.clear_session(session_id);
    }));

    Ok(AppState {
        config,
        gateway,
        providers,
        stages: Arc::new(Stages::new()),
        pipeline,
        history,
        inspector,
        sessions,
        coordinator,
        approvals,
        speech,
    })
}

/// Run the HTTP server until shutdown.
pub async fn serve(config: Arc<Config>) -> Result<()> {
    let client = default_llm_client(&config);
    let state = build_state(Arc::clone(&config), client, Arc::new(NullSynthesizer)).await?;
    let providers = Arc::clone(&state.providers);

    let app = crate::api::router(state);
    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Transport(format!("cannot bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "tandem listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Transport(format!("server error: {e}")));

    providers.shutdown().await;
    result
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
