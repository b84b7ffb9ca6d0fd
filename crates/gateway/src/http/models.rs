//! Model catalog proxy with search/tool-support filtering and facet counts
//! (spec §6 `/api/models`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use crate::app::AppState;
use crate::auth::check_auth;

fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" })))
}

#[derive(Deserialize)]
pub struct ModelsQuery {
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    tools_only: bool,
}

pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !check_auth(&state, &headers) {
        return Err(unauthorized());
    }

    let catalog = state
        .provider
        .list_models()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, Json(serde_json::json!({ "error": e.to_string() }))))?;

    let entries = catalog
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let search = query.search.as_deref().map(str::to_lowercase);
    let filtered: Vec<Value> = entries
        .into_iter()
        .filter(|entry| matches_search(entry, search.as_deref()))
        .filter(|entry| !query.tools_only || supports_tools(entry))
        .collect();

    let facets = compute_facets(&filtered);

    Ok(Json(serde_json::json!({
        "data": filtered,
        "facets": facets,
    })))
}

fn matches_search(entry: &Value, search: Option<&str>) -> bool {
    let Some(search) = search else { return true };
    let id = entry.get("id").and_then(Value::as_str).unwrap_or_default();
    let name = entry.get("name").and_then(Value::as_str).unwrap_or_default();
    id.to_lowercase().contains(search) || name.to_lowercase().contains(search)
}

fn supports_tools(entry: &Value) -> bool {
    entry
        .get("supported_parameters")
        .and_then(Value::as_array)
        .map(|params| params.iter().any(|p| p.as_str() == Some("tools")))
        .unwrap_or(false)
}

/// Counts models per provider prefix (the segment of `id` before the first
/// `/`, e.g. `openai/gpt-4o` → `openai`) and how many support tool calling.
fn compute_facets(entries: &[Value]) -> Value {
    let mut by_provider: HashMap<String, u64> = HashMap::new();
    let mut tool_capable = 0u64;

    for entry in entries {
        let id = entry.get("id").and_then(Value::as_str).unwrap_or_default();
        let provider = id.split_once('/').map(|(p, _)| p).unwrap_or("unknown");
        *by_provider.entry(provider.to_string()).or_insert(0) += 1;
        if supports_tools(entry) {
            tool_capable += 1;
        }
    }

    serde_json::json!({
        "total": entries.len(),
        "by_provider": by_provider,
        "tool_capable": tool_capable,
    })
}
