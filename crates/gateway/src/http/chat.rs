//! POST /api/chat/stream — the orchestrator's single entry point (spec §6).
//!
//! Drains `orchestrator::process_stream`'s event channel into SSE frames.
//! Client disconnect is detected the same way the underlying channel signals
//! it everywhere else: when Axum drops this handler's response body future
//! (because the client went away), the `CancelOnDrop` guard captured by the
//! stream is dropped with it, which cancels the turn's token.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use orchestrator::{process_stream, ProcessedTurn};
use repository::{Content as RepoContent, ContentPart as RepoContentPart};

use crate::app::AppState;
use crate::auth::check_auth;

#[derive(Debug, Deserialize)]
pub struct ChatStreamRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    #[allow(dead_code)]
    pub role: String,
    pub content: WireContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePart {
    Text { text: String },
    ImageUrl {
        url: String,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        attachment_id: Option<String>,
    },
}

impl From<WireContent> for RepoContent {
    fn from(value: WireContent) -> Self {
        match value {
            WireContent::Text(text) => RepoContent::Plain { text },
            WireContent::Parts(parts) => RepoContent::Parts {
                parts: parts
                    .into_iter()
                    .map(|p| match p {
                        WirePart::Text { text } => RepoContentPart::Text { text },
                        WirePart::ImageUrl { url, mime_type, attachment_id } => {
                            RepoContentPart::ImageUrl { url, mime_type, attachment_id }
                        }
                    })
                    .collect(),
            },
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatStreamRequest>,
) -> axum::response::Response {
    if !check_auth(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody { error: "unauthorized".to_string() }),
        )
            .into_response();
    }

    let Some(last) = req.messages.into_iter().last() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody { error: "messages must contain at least one entry".to_string() }),
        )
            .into_response();
    };

    let cancel = CancellationToken::new();
    let rx = process_stream(
        state.turn_ctx.clone(),
        req.session_id,
        last.content.into(),
        req.timezone,
        req.model,
        cancel.clone(),
    );

    let stream = event_stream(rx, CancelOnDrop(cancel));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Cancels its token when dropped — including when the SSE body future is
/// dropped mid-stream because the client disconnected.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn event_stream(
    mut rx: tokio::sync::mpsc::Receiver<ProcessedTurn>,
    guard: CancelOnDrop,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let _guard = guard;
        while let Some(turn) = rx.recv().await {
            match turn {
                ProcessedTurn::Session { session_id } => {
                    yield Ok(Event::default().event("session").data(json!({ "session_id": session_id }).to_string()));
                }
                ProcessedTurn::Delta { text } => {
                    let payload = json!({ "choices": [{ "delta": { "content": text } }] });
                    yield Ok(Event::default().data(payload.to_string()));
                }
                ProcessedTurn::ToolStarted { call_id, name } => {
                    let payload = json!({ "name": name, "status": "started", "call_id": call_id });
                    yield Ok(Event::default().event("tool").data(payload.to_string()));
                }
                ProcessedTurn::ToolFinished { call_id, name, result } => {
                    let payload = json!({ "name": name, "status": "finished", "call_id": call_id, "result": result });
                    yield Ok(Event::default().event("tool").data(payload.to_string()));
                }
                ProcessedTurn::ToolError { call_id, name, reason, transient } => {
                    let payload = json!({
                        "name": name, "status": "error", "call_id": call_id,
                        "result": reason, "transient": transient,
                    });
                    yield Ok(Event::default().event("tool").data(payload.to_string()));
                }
                ProcessedTurn::Error { code, message } => {
                    let payload = json!({ "error": { "code": code, "message": message } });
                    yield Ok(Event::default().data(payload.to_string()));
                }
                ProcessedTurn::Done => {
                    yield Ok(Event::default().data("[DONE]"));
                }
            }
        }
    }
}
