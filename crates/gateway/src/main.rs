use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use attachments::{AttachmentService, BlobStore, UrlSigner};
use gateway_core::config::{
    AppConfig, AttachmentsConfig, DatabaseConfig, OrchestratorConfig, ProviderConfig, ServerConfig,
    TimeoutsConfig,
};
use model_settings::{ModelConfigSnapshot, ModelSettingsService, PresetService, TitleCompletion};
use orchestrator::openai::OpenAiProvider;
use orchestrator::pipeline::TurnContext;
use orchestrator::provider::{ChatRequest, Content, LlmProvider, Message, Role, SamplingParameters};
use repository::Repository;
use tool_aggregator::ToolAggregator;

mod app;
mod auth;
mod http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_gateway=info,tower_http=debug".into()),
        )
        .init();

    let config_path = std::env::var("GATEWAY_CONFIG").ok();
    let config = AppConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "config load failed, falling back to an unconfigured default");
        fallback_config()
    });

    std::fs::create_dir_all(&config.state_dir)?;
    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let repository = Arc::new(Repository::new(&config.database.path)?);

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.timeouts.provider_total_secs))
        .build()?;
    let provider: Arc<dyn LlmProvider> = Arc::new(OpenAiProvider::new(
        http_client,
        config.provider.api_key.clone(),
        config.provider.base_url.clone(),
    ));

    let model_settings = Arc::new(ModelSettingsService::load_or_init(
        format!("{}/active_model.json", config.state_dir),
        ModelConfigSnapshot::new(config.provider.default_model.clone()),
    )?);

    let presets = Arc::new(PresetService::load_or_init(
        format!("{}/presets.json", config.state_dir),
        format!("{}/tool_configs.json", config.state_dir),
        model_settings.clone(),
    )?);

    let aggregator = Arc::new(
        ToolAggregator::new()
            .with_tool_call_timeout(std::time::Duration::from_secs(config.timeouts.tool_call_secs)),
    );
    app::refresh_aggregator_from_presets(&aggregator, &presets).await;

    let blob_store = BlobStore::local(std::path::Path::new(&config.state_dir).join("blobs").as_path())?;
    let signer = UrlSigner::new(&config.attachments.base_url, config.attachments.signing_secret.clone());
    let attachment_service = Arc::new(AttachmentService::new(
        repository.clone(),
        blob_store.clone(),
        signer.clone(),
        config.attachments.allowed_mime_types.clone(),
        config.attachments.max_size_bytes,
        config.attachments.retention_days,
    ));

    let title_completion: Arc<dyn TitleCompletion> = Arc::new(ProviderTitleCompletion {
        provider: provider.clone(),
        model_id: config
            .provider
            .planner_model
            .clone()
            .unwrap_or_else(|| config.provider.default_model.clone()),
    });

    let turn_ctx = Arc::new(TurnContext {
        repository: repository.clone(),
        provider: provider.clone(),
        aggregator: aggregator.clone(),
        model_settings: model_settings.clone(),
        attachments: attachment_service.clone(),
        title_completion: Some(title_completion),
        max_tool_iterations: config.orchestrator.max_tool_iterations,
        planner_enabled: config.orchestrator.planner_enabled,
        planner_model: config
            .provider
            .planner_model
            .clone()
            .unwrap_or_else(|| config.provider.default_model.clone()),
    });

    let bind = config.server.bind.clone();
    let port = config.server.port;

    let state = Arc::new(app::AppState {
        config: Arc::new(config),
        repository,
        provider,
        aggregator,
        model_settings,
        presets,
        attachments: attachment_service,
        blob_store,
        signer,
        turn_ctx,
        active_operations: Default::default(),
    });

    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(git_sha = env!("GATEWAY_GIT_SHA"), "chat gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

fn fallback_config() -> AppConfig {
    AppConfig {
        server: ServerConfig::default(),
        provider: ProviderConfig {
            api_key: String::new(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            default_model: "openai/gpt-4o-mini".to_string(),
            planner_model: None,
            system_prompt: None,
        },
        attachments: AttachmentsConfig::default(),
        database: DatabaseConfig::default(),
        timeouts: TimeoutsConfig::default(),
        orchestrator: OrchestratorConfig::default(),
        state_dir: std::env::var("HOME")
            .map(|home| format!("{home}/.chat-gateway"))
            .unwrap_or_else(|_| ".chat-gateway".to_string()),
    }
}

/// Adapts the gateway's single [`LlmProvider`] into `model-settings`'
/// dependency-free [`TitleCompletion`] trait (see `model-settings/src/title.rs`).
struct ProviderTitleCompletion {
    provider: Arc<dyn LlmProvider>,
    model_id: String,
}

#[async_trait]
impl TitleCompletion for ProviderTitleCompletion {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, String> {
        let request = ChatRequest {
            model: self.model_id.clone(),
            system: String::new(),
            messages: vec![Message {
                role: Role::User,
                content: Content::text(prompt),
                tool_calls: Vec::new(),
                tool_call_id: None,
            }],
            parameters: SamplingParameters {
                max_tokens: Some(max_tokens),
                ..Default::default()
            },
            provider_overrides: Default::default(),
            stream: false,
            tools: Vec::new(),
        };

        self.provider
            .send(&request)
            .await
            .map(|resp| resp.content.as_flat_text())
            .map_err(|e| e.to_string())
    }
}
