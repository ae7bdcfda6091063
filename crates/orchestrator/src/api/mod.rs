//! Thin HTTP surface over the orchestrator core.

mod chat;
mod health;
mod session;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat/stream", post(chat::chat_stream))
        .route("/session/pause", post(session::pause))
        .route("/session/resume", post(session::resume))
        .route("/session/confirm", post(session::confirm))
        .route("/health", get(health::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
