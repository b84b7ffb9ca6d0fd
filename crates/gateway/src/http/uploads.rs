//! User upload intake and signed-URL download (spec §6 `/api/uploads`,
//! `/api/attachments/{*key}`, §4.5).

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use attachments::SavedAttachment;

use crate::app::AppState;
use crate::auth::check_auth;

fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" })))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": message.into() })))
}

#[derive(Serialize)]
struct AttachmentBody {
    id: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(rename = "sizeBytes")]
    size_bytes: u64,
    #[serde(rename = "displayUrl")]
    display_url: String,
    #[serde(rename = "deliveryUrl")]
    delivery_url: String,
}

#[derive(Serialize)]
struct UploadResponse {
    attachment: AttachmentBody,
}

impl From<SavedAttachment> for AttachmentBody {
    fn from(saved: SavedAttachment) -> Self {
        // The gateway serves attachments directly, so a fetchable display
        // URL and the storage delivery URL are the same signed link.
        AttachmentBody {
            id: saved.attachment_id,
            mime_type: saved.mime,
            size_bytes: saved.size,
            display_url: saved.signed_url.clone(),
            delivery_url: saved.signed_url,
        }
    }
}

pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> axum::response::Response {
    if !check_auth(&state, &headers) {
        return unauthorized().into_response();
    }

    let mut session_id: Option<String> = None;
    let mut file_bytes: Option<Bytes> = None;
    let mut declared_mime = "application/octet-stream".to_string();
    let mut declared_name = "upload".to_string();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(e.to_string()).into_response(),
        };

        match field.name().unwrap_or_default() {
            "session_id" => {
                session_id = field.text().await.ok();
            }
            "file" => {
                declared_name = field.file_name().unwrap_or("upload").to_string();
                declared_mime = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                file_bytes = match field.bytes().await {
                    Ok(bytes) => Some(bytes),
                    Err(e) => return bad_request(e.to_string()).into_response(),
                };
            }
            _ => {}
        }
    }

    let Some(session_id) = session_id else {
        return bad_request("missing session_id field").into_response();
    };
    let Some(file_bytes) = file_bytes else {
        return bad_request("missing file field").into_response();
    };

    match state
        .attachments
        .save_upload(&session_id, file_bytes, &declared_mime, &declared_name)
        .await
    {
        Ok(saved) => Json(UploadResponse { attachment: saved.into() }).into_response(),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    expires: i64,
    sig: String,
}

pub async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> axum::response::Response {
    if !state.signer.verify(&key, query.expires, &query.sig) {
        return (StatusCode::FORBIDDEN, "signature invalid or expired").into_response();
    }

    let bytes = match state.blob_store.get(&key).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let mime_type = attachment_id_from_key(&key)
        .and_then(|id| state.repository.get_attachment(&id).ok().flatten())
        .map(|a| a.mime_type)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    ([(header::CONTENT_TYPE, mime_type)], bytes).into_response()
}

/// Recovers the `attachment_id` from a `{session_id}/{attachment_id}` or
/// `{session_id}/{attachment_id}__{name}` blob key (spec §4.5 invariant on
/// blob-key structure).
fn attachment_id_from_key(key: &str) -> Option<String> {
    let after_session = key.split_once('/')?.1;
    let id = after_session.split_once("__").map(|(id, _)| id).unwrap_or(after_session);
    Some(id.to_string())
}
