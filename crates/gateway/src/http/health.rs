use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health — liveness probe, returns server metadata and the current
/// tool catalog size (a cheap signal the aggregator is warm).
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let catalog = state.aggregator.catalog().await;

    Json(json!({
        "status": "ok",
        "git_sha": env!("GATEWAY_GIT_SHA"),
        "model": state.model_settings.get_active().await.model_id,
        "tool_count": catalog.len(),
    }))
}
