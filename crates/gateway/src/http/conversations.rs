//! Session listing, deletion, message history, and title generation
//! (spec §6 `/api/chat/conversations`, `/api/chat/session/{id}*`).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use repository::{Message, SessionSummary, TitleSource};

use crate::app::AppState;
use crate::auth::check_auth;

fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" })))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    search: Option<String>,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SessionSummary>>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    let sessions = state
        .repository
        .list_sessions(query.limit, query.offset, query.search.as_deref())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;
    Ok(Json(sessions))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    state.repository.delete_session(&id).await.map_err(|e| {
        let status = match &e {
            repository::RepositoryError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": e.to_string() })))
    })?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<Message>>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    let messages = state
        .repository
        .list_messages(&id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;

    // Refresh any image attachment URLs that are near expiry (spec §4.5
    // `refresh_if_stale`) before returning history to the client.
    let mut refreshed = Vec::with_capacity(messages.len());
    for message in messages {
        refreshed.push(state.attachments.refresh_message_urls(message).await);
    }
    Ok(Json(refreshed))
}

#[derive(Serialize)]
pub struct GenerateTitleResponse {
    session_id: String,
    title: String,
    title_source: TitleSource,
}

pub async fn generate_title(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<GenerateTitleResponse>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }

    let Some(completion) = state.turn_ctx.title_completion.clone() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "title generation is not configured" })),
        ));
    };

    let history = state
        .repository
        .list_messages(&id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;

    let conversation_text: String = history
        .iter()
        .filter(|m| matches!(m.role, repository::MessageRole::User | repository::MessageRole::Assistant))
        .map(|m| format!("{}: {}", m.role, flat_text(&m.content)))
        .collect::<Vec<_>>()
        .join("\n");

    let title = model_settings::generate_title(&*completion, &conversation_text)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;

    state
        .repository
        .set_title(&id, &title, TitleSource::Ai)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;

    Ok(Json(GenerateTitleResponse { session_id: id, title, title_source: TitleSource::Ai }))
}

fn flat_text(content: &repository::Content) -> String {
    match content {
        repository::Content::Plain { text } => text.clone(),
        repository::Content::Parts { parts } => parts
            .iter()
            .filter_map(|p| match p {
                repository::ContentPart::Text { text } => Some(text.clone()),
                repository::ContentPart::ToolResultText { text } => Some(text.clone()),
                repository::ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
