//! `GET /health` — component readiness.

use axum::extract::State;
use axum::Json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let providers: Vec<serde_json::Value> = state
        .providers
        .health()
        .into_iter()
        .map(|p| serde_json::json!({ "name": p.name, "state": p.state }))
        .collect();

    let circuits: Vec<serde_json::Value> = state
        .gateway
        .circuit_status()
        .into_iter()
        .map(|(service, circuit)| serde_json::json!({ "service": service, "state": circuit }))
        .collect();

    Json(serde_json::json!({
        "orchestrator": "ok",
        "sessions": state.sessions.len(),
        "providers": providers,
        "llm_gateway": { "circuits": circuits },
    }))
}
