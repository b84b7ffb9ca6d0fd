use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use tracing::warn;

use attachments::{AttachmentService, BlobStore, UrlSigner};
use gateway_core::config::AppConfig;
use model_settings::{ModelSettingsService, PresetService};
use orchestrator::pipeline::TurnContext;
use orchestrator::provider::LlmProvider;
use repository::Repository;
use tool_aggregator::{ToolAggregator, ToolServerConfig};

/// Central shared state — passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repository: Arc<Repository>,
    pub provider: Arc<dyn LlmProvider>,
    pub aggregator: Arc<ToolAggregator>,
    pub model_settings: Arc<ModelSettingsService>,
    pub presets: Arc<PresetService>,
    pub attachments: Arc<AttachmentService>,
    /// Held directly (in addition to inside `attachments`) so the download
    /// route can verify and serve a signed URL without the service's
    /// validation/recording path.
    pub blob_store: BlobStore,
    pub signer: UrlSigner,
    pub turn_ctx: Arc<TurnContext>,
    /// In-flight `/api/chat/stream` turns keyed by session id, so a future
    /// operator-facing cancel endpoint (or a reconnect-and-replace) can stop
    /// one without tearing down the process.
    pub active_operations: DashMap<String, CancellationToken>,
}

/// Assembles the full Axum router (spec §6 "Client → Server HTTP surface").
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/api/chat/stream", post(crate::http::chat::stream_handler))
        .route(
            "/api/chat/conversations",
            get(crate::http::conversations::list_conversations),
        )
        .route(
            "/api/chat/session/{id}",
            delete(crate::http::conversations::delete_session),
        )
        .route(
            "/api/chat/session/{id}/messages",
            get(crate::http::conversations::list_messages),
        )
        .route(
            "/api/chat/session/{id}/generate-title",
            post(crate::http::conversations::generate_title),
        )
        .route(
            "/api/settings/model",
            get(crate::http::settings::get_model).put(crate::http::settings::put_model),
        )
        .route(
            "/api/presets/",
            get(crate::http::presets::list_presets).post(crate::http::presets::save_preset),
        )
        .route(
            "/api/presets/{name}",
            get(crate::http::presets::get_preset)
                .put(crate::http::presets::save_named_preset)
                .delete(crate::http::presets::delete_preset),
        )
        .route(
            "/api/presets/{name}/apply",
            post(crate::http::presets::apply_preset),
        )
        .route(
            "/api/mcp/servers",
            get(crate::http::mcp::get_servers).put(crate::http::mcp::put_servers),
        )
        .route("/api/mcp/servers/refresh", post(crate::http::mcp::refresh_servers))
        .route("/api/uploads", post(crate::http::uploads::upload_handler))
        .route(
            "/api/attachments/{*key}",
            get(crate::http::uploads::download_handler),
        )
        .route("/api/models", get(crate::http::models::list_models))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}

/// Deserializes the preset service's opaque tool-server config JSON and
/// rebuilds the aggregator's catalog — the path both startup and `PUT
/// /api/mcp/servers`/`POST /api/mcp/servers/refresh` drive at runtime.
pub async fn refresh_aggregator_from_presets(aggregator: &ToolAggregator, presets: &PresetService) {
    let raw = presets.current_tool_configs().await;
    let configs: Vec<ToolServerConfig> = raw
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v.clone()) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, config = %v, "skipping malformed persisted tool-server config");
                None
            }
        })
        .collect();
    aggregator.refresh(configs).await;
}

