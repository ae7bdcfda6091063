//! Session control endpoints: pause, resume, confirm.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub confirmed: bool,
}

/// `POST /session/pause` — idempotent.
pub async fn pause(
    State(state): State<AppState>,
    Json(body): Json<SessionRequest>,
) -> impl IntoResponse {
    match state.sessions.get(&body.session_id) {
        Some(handle) => {
            handle.pause.pause();
            tracing::info!(session_id = %body.session_id, "session paused");
            (StatusCode::OK, Json(serde_json::json!({ "paused": true }))).into_response()
        }
        None => session_not_found(&body.session_id),
    }
}

/// `POST /session/resume` — dual of pause.
pub async fn resume(
    State(state): State<AppState>,
    Json(body): Json<SessionRequest>,
) -> impl IntoResponse {
    match state.sessions.get(&body.session_id) {
        Some(handle) => {
            handle.pause.resume();
            tracing::info!(session_id = %body.session_id, "session resumed");
            (StatusCode::OK, Json(serde_json::json!({ "paused": false }))).into_response()
        }
        None => session_not_found(&body.session_id),
    }
}

/// `POST /session/confirm` — resolves a pending `approval_required`.
pub async fn confirm(
    State(state): State<AppState>,
    Json(body): Json<ConfirmRequest>,
) -> impl IntoResponse {
    let resolved = state.approvals.resolve(&body.session_id, body.confirmed);
    if resolved {
        (StatusCode::OK, Json(serde_json::json!({ "resolved": true }))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no pending approval for this session" })),
        )
            .into_response()
    }
}

fn session_not_found(session_id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("unknown session '{session_id}'") })),
    )
        .into_response()
}
