//! Active model configuration (spec §6 `/api/settings/model`, §4.6).

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::Value;

use model_settings::ModelConfigSnapshot;

use crate::app::AppState;
use crate::auth::check_auth;

fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" })))
}

pub async fn get_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Arc<ModelConfigSnapshot>>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    Ok(Json(state.model_settings.get_active().await))
}

pub async fn put_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(snapshot): Json<ModelConfigSnapshot>,
) -> Result<Json<Arc<ModelConfigSnapshot>>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    let stored = state
        .model_settings
        .set_active(snapshot)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;
    Ok(Json(stored))
}
