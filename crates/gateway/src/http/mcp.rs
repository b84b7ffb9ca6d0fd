//! Tool-server configuration and catalog refresh (spec §6 `/api/mcp/servers*`).

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::Value;

use tool_aggregator::ToolServerConfig;

use crate::app::{refresh_aggregator_from_presets, AppState};
use crate::auth::check_auth;

fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" })))
}

pub async fn get_servers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    Ok(Json(state.presets.current_tool_configs().await))
}

pub async fn put_servers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(configs): Json<Vec<Value>>,
) -> Result<Json<Vec<Value>>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }

    for raw in &configs {
        if let Err(e) = serde_json::from_value::<ToolServerConfig>(raw.clone()) {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("invalid tool server config: {e}") })),
            ));
        }
    }

    state
        .presets
        .set_tool_configs(configs.clone())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))))?;

    refresh_aggregator_from_presets(&state.aggregator, &state.presets).await;

    Ok(Json(configs))
}

pub async fn refresh_servers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    refresh_aggregator_from_presets(&state.aggregator, &state.presets).await;
    Ok(StatusCode::NO_CONTENT)
}
