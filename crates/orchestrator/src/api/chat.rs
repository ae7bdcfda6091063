//! `POST /chat/stream` — run a workflow and stream its events as SSE.

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::Stream;
use serde::Deserialize;

use td_domain::event::{Event, EventPayload, TerminalOutcome, ToolPhase};
use td_domain::todo::ItemStatus;

use crate::executor::Executor;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    let (session_id, handle, _created) = state.sessions.resolve_or_create(body.session_id.as_deref());

    if handle.data.lock().running {
        let stream = futures_util::stream::once(async {
            Ok::<_, std::convert::Infallible>(
                SseEvent::default()
                    .event("error")
                    .data(r#"{"kind":"busy","message":"a workflow is already running for this session"}"#),
            )
        });
        return Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    }

    // Subscribe before the run starts so no event can be missed.
    let rx = state.coordinator.subscribe(&session_id).await;

    let executor_state = state.clone();
    let run_session = session_id.clone();
    tokio::spawn(async move {
        Executor::new(executor_state).run(&run_session, &body.message).await;
    });

    Sse::new(sse_stream(rx)).keep_alive(KeepAlive::default()).into_response()
}

fn sse_stream(
    mut rx: tokio::sync::mpsc::Receiver<Event>,
) -> impl Stream<Item = Result<SseEvent, std::convert::Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let name = sse_event_name(&event);
            let terminal = matches!(event.payload, EventPayload::Terminal { .. });
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(SseEvent::default().event(name).data(data));
            if terminal {
                break;
            }
        }
    }
}

/// Map an internal event to its client-facing SSE event name.
pub(crate) fn sse_event_name(event: &Event) -> &'static str {
    match &event.payload {
        EventPayload::Chat { .. } => "agent",
        EventPayload::TtsChunk { .. } => "tts_chunk",
        EventPayload::StageTransition { .. } => "stage",
        EventPayload::Progress { todo: Some(_), .. } => "todo",
        EventPayload::Progress { status: Some(ItemStatus::Completed), .. } => "item_verified",
        EventPayload::Progress { status: Some(_), .. } => "item_executing",
        EventPayload::Progress { .. } => "stage",
        EventPayload::Tool { phase: ToolPhase::ApprovalRequired, .. } => "approval_required",
        EventPayload::Tool { .. } => "item_executing",
        EventPayload::Terminal { outcome: TerminalOutcome::Failed, .. } => "error",
        EventPayload::Terminal { .. } => "complete",
    }
}
