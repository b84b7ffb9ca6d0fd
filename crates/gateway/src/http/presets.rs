//! Named preset CRUD and atomic apply (spec §6 `/api/presets*`, §4.6).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use model_settings::{ModelSettingsError, Preset};

use crate::app::{refresh_aggregator_from_presets, AppState};
use crate::auth::check_auth;

fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" })))
}

fn preset_error_status(e: &ModelSettingsError) -> StatusCode {
    match e {
        ModelSettingsError::PresetNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn list_presets(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Preset>>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    Ok(Json(state.presets.list().await))
}

pub async fn get_preset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Preset>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    state
        .presets
        .get(&name)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "preset not found" }))))
}

#[derive(Deserialize)]
pub struct NamePayload {
    name: String,
}

/// Builds a preset from the currently active model config and tool-server
/// configs — a POST/PUT body only ever supplies the name to save under.
async fn snapshot_as_preset(state: &AppState, name: String) -> Preset {
    let active = state.model_settings.get_active().await;
    let tool_server_configs = state.presets.current_tool_configs().await;
    Preset {
        name,
        model_id: active.model_id.clone(),
        provider_overrides: active.provider_overrides.clone(),
        parameters: active.parameters.clone(),
        system_prompt: active.system_prompt.clone(),
        tool_server_configs,
    }
}

pub async fn save_preset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<NamePayload>,
) -> Result<Json<Preset>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    let preset = snapshot_as_preset(&state, payload.name).await;
    state
        .presets
        .save(preset.clone())
        .await
        .map_err(|e| (preset_error_status(&e), Json(serde_json::json!({ "error": e.to_string() }))))?;
    Ok(Json(preset))
}

pub async fn save_named_preset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Preset>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    let preset = snapshot_as_preset(&state, name).await;
    state
        .presets
        .save(preset.clone())
        .await
        .map_err(|e| (preset_error_status(&e), Json(serde_json::json!({ "error": e.to_string() }))))?;
    Ok(Json(preset))
}

pub async fn delete_preset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    state
        .presets
        .delete(&name)
        .await
        .map_err(|e| (preset_error_status(&e), Json(serde_json::json!({ "error": e.to_string() }))))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Applies a preset, then refreshes the tool aggregator to match. If the
/// refresh step itself fails the active model has already rolled back inside
/// `PresetService::apply` on the settings side, matching the "atomic apply"
/// property (spec §8 S6) for everything but a mid-refresh aggregator panic.
pub async fn apply_preset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<model_settings::ModelConfigSnapshot>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }
    let snapshot = state
        .presets
        .apply(&name)
        .await
        .map_err(|e| (preset_error_status(&e), Json(serde_json::json!({ "error": e.to_string() }))))?;

    refresh_aggregator_from_presets(&state.aggregator, &state.presets).await;

    Ok(Json(snapshot))
}
