//! The orchestrator's HTTP surface: session messaging, cancellation, and
//! an SSE stream of `ServerMessage`s for a session's attached clients.
//!
//! Kept deliberately small — one file — since the orchestrator's real
//! surface area lives in `cro-orchestrator` and this crate is just the
//! transport wiring on top of it.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use cro_domain::protocol::{ConnectionHandle, ServerMessage};
use cro_orchestrator::SubmitOutcome;
use futures_util::stream::Stream;
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/debug/sessions/:session_id", get(debug_session))
        .route("/sessions/:session_id/messages", post(submit_message))
        .route("/sessions/:session_id/cancel", post(cancel_output))
        .route("/sessions/:session_id", delete(delete_session))
        .route("/sessions/:session_id/events", get(list_events))
        .route("/sessions/:session_id/stream", get(connect_stream))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn debug_session(State(state): State<AppState>, Path(session_id): Path<String>) -> impl IntoResponse {
    Json(serde_json::json!({
        "session_id": session_id,
        "running": state.hub.is_running(&session_id),
        "deleted": state.hub.is_deleted(&session_id),
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitMessageBody {
    agent_id: String,
    text: String,
}

async fn submit_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<SubmitMessageBody>,
) -> impl IntoResponse {
    match state.hub.submit_message(&session_id, &body.agent_id, &body.text) {
        Ok(SubmitOutcome::Started { response_id }) => {
            Json(serde_json::json!({ "status": "started", "response_id": response_id })).into_response()
        }
        Ok(SubmitOutcome::Queued { response_id }) => {
            Json(serde_json::json!({ "status": "queued", "response_id": response_id })).into_response()
        }
        Err(e) => (
            axum::http::StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": { "code": e.code(), "message": e.to_string() } })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct CancelBody {
    #[serde(default)]
    audio_end_ms: Option<f64>,
}

async fn cancel_output(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<CancelBody>,
) -> impl IntoResponse {
    match state.hub.handle_output_cancel(&session_id, body.audio_end_ms).await {
        Ok(()) => Json(serde_json::json!({ "status": "ok" })).into_response(),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": { "code": e.code(), "message": e.to_string() } })),
        )
            .into_response(),
    }
}

async fn delete_session(State(state): State<AppState>, Path(session_id): Path<String>) -> impl IntoResponse {
    state.hub.delete_session(&session_id);
    Json(serde_json::json!({ "status": "deleted" }))
}

#[derive(Debug, Deserialize, Default)]
struct ListEventsQuery {
    #[serde(default)]
    after: Option<Uuid>,
}

async fn list_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    axum::extract::Query(q): axum::extract::Query<ListEventsQuery>,
) -> impl IntoResponse {
    let result = match q.after {
        Some(id) => state.hub.events_since(&session_id, id),
        None => state.hub.events(&session_id),
    };
    match result {
        Ok(events) => Json(serde_json::json!({ "events": events })).into_response(),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": { "code": e.code(), "message": e.to_string() } })),
        )
            .into_response(),
    }
}

/// A connection backed by an SSE stream: `send` pushes onto an unbounded
/// channel the stream task drains, rather than writing the socket itself.
struct SseConnection {
    id: String,
    tx: tokio::sync::mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle for SseConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, message: &ServerMessage) -> bool {
        self.tx.send(message.clone()).is_ok()
    }
}

async fn connect_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ServerMessage>();

    let conn = Arc::new(SseConnection { id: connection_id.clone(), tx });
    state.hub.attach_connection(&session_id, conn);

    let hub = state.hub.clone();
    let detach_session_id = session_id.clone();
    let stream = async_stream::stream! {
        while let Some(message) = rx.recv().await {
            let event_type = serde_json::to_value(&message)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned))
                .unwrap_or_else(|| "message".to_owned());
            let data = serde_json::to_string(&message).unwrap_or_default();
            yield Ok(Event::default().event(event_type).data(data));
        }
        hub.detach_connection(&detach_session_id, &connection_id);
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
