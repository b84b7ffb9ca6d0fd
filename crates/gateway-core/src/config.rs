use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 8;

pub const DEFAULT_PROVIDER_TOTAL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_PROVIDER_FIRST_BYTE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TOOL_CALL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PLANNER_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_TOOL_SERVER_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TOOL_SERVER_RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_TOOL_SERVER_RECONNECT_INTERVAL_SECS: u64 = 2;

pub const DEFAULT_ATTACHMENTS_MAX_SIZE_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_ATTACHMENTS_RETENTION_DAYS: u64 = 7;
/// `refresh_if_stale` reissues a signed URL once its remaining lifetime
/// drops below this threshold (spec §4.5).
pub const DEFAULT_ATTACHMENTS_REFRESH_THRESHOLD_SECS: i64 = 24 * 60 * 60;

pub const DEFAULT_TITLE_GEN_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_TITLE_GEN_MAX_TOKENS: u32 = 30;
pub const DEFAULT_TITLE_GEN_MAX_CONTEXT_CHARS: usize = 4000;

/// Retry defaults for transient provider errors (spec §9 Open Question,
/// resolved in SPEC_FULL.md §9).
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 250;
pub const RETRY_MAX_DELAY_MS: u64 = 4_000;
pub const RETRY_JITTER_MAX_MS: u64 = 50;

/// Top-level config (gateway.toml + env var overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Directory holding the model-settings JSON files (active snapshot,
    /// presets, tool-server configs) and the local object-store root.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared bearer token required on every client-facing HTTP request.
    /// `None` disables auth (local development only).
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth_token: None,
        }
    }
}

/// The single upstream LLM provider. Spec §1 assumes "an upstream provider
/// that accepts an OpenAI-style chat-completion request" — one endpoint,
/// not the teacher's per-vendor provider table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Cheap model id used by the Tool Planner (§4.1.1). Falls back to
    /// `default_model` when unset.
    pub planner_model: Option<String>,
    /// Persistent system prompt appended after the generated time preamble.
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentsConfig {
    #[serde(default = "default_attachments_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_attachments_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
    /// Prefix the gateway's own download route is served under, used to
    /// build signed URLs (e.g. `http://localhost:8080/api/attachments`).
    #[serde(default = "default_attachments_base_url")]
    pub base_url: String,
    /// HMAC-style secret mixed into the signed-URL digest. Must be set in
    /// production; the default is only fit for local development.
    #[serde(default = "default_attachments_signing_secret")]
    pub signing_secret: String,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_attachments_max_size_bytes(),
            retention_days: default_attachments_retention_days(),
            allowed_mime_types: default_allowed_mime_types(),
            base_url: default_attachments_base_url(),
            signing_secret: default_attachments_signing_secret(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_provider_total_timeout")]
    pub provider_total_secs: u64,
    #[serde(default = "default_provider_first_byte_timeout")]
    pub provider_first_byte_secs: u64,
    #[serde(default = "default_tool_call_timeout")]
    pub tool_call_secs: u64,
    #[serde(default = "default_planner_timeout")]
    pub planner_secs: u64,
    #[serde(default = "default_tool_server_connect_timeout")]
    pub tool_server_connect_secs: u64,
    #[serde(default = "default_tool_server_reconnect_attempts")]
    pub tool_server_reconnect_attempts: u32,
    #[serde(default = "default_tool_server_reconnect_interval")]
    pub tool_server_reconnect_interval_secs: u64,
    #[serde(default = "default_title_gen_timeout")]
    pub title_generation_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            provider_total_secs: default_provider_total_timeout(),
            provider_first_byte_secs: default_provider_first_byte_timeout(),
            tool_call_secs: default_tool_call_timeout(),
            planner_secs: default_planner_timeout(),
            tool_server_connect_secs: default_tool_server_connect_timeout(),
            tool_server_reconnect_attempts: default_tool_server_reconnect_attempts(),
            tool_server_reconnect_interval_secs: default_tool_server_reconnect_interval(),
            title_generation_secs: default_title_gen_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// Whether the Tool Planner (§4.1.1) is consulted before each turn.
    #[serde(default = "bool_true")]
    pub planner_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            planner_enabled: true,
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_attachments_max_size_bytes() -> u64 {
    DEFAULT_ATTACHMENTS_MAX_SIZE_BYTES
}
fn default_attachments_retention_days() -> u64 {
    DEFAULT_ATTACHMENTS_RETENTION_DAYS
}
fn default_attachments_base_url() -> String {
    format!("http://{DEFAULT_BIND}:{DEFAULT_PORT}/api/attachments")
}
fn default_attachments_signing_secret() -> String {
    "dev-only-insecure-signing-secret".to_string()
}
fn default_allowed_mime_types() -> Vec<String> {
    vec![
        "image/png".to_string(),
        "image/jpeg".to_string(),
        "image/webp".to_string(),
        "image/gif".to_string(),
        "application/pdf".to_string(),
    ]
}
fn default_db_path() -> String {
    format!("{}/gateway.db", default_state_dir())
}
fn default_state_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.chat-gateway", home)
}
fn default_provider_total_timeout() -> u64 {
    DEFAULT_PROVIDER_TOTAL_TIMEOUT_SECS
}
fn default_provider_first_byte_timeout() -> u64 {
    DEFAULT_PROVIDER_FIRST_BYTE_TIMEOUT_SECS
}
fn default_tool_call_timeout() -> u64 {
    DEFAULT_TOOL_CALL_TIMEOUT_SECS
}
fn default_planner_timeout() -> u64 {
    DEFAULT_PLANNER_TIMEOUT_SECS
}
fn default_tool_server_connect_timeout() -> u64 {
    DEFAULT_TOOL_SERVER_CONNECT_TIMEOUT_SECS
}
fn default_tool_server_reconnect_attempts() -> u32 {
    DEFAULT_TOOL_SERVER_RECONNECT_ATTEMPTS
}
fn default_tool_server_reconnect_interval() -> u64 {
    DEFAULT_TOOL_SERVER_RECONNECT_INTERVAL_SECS
}
fn default_title_gen_timeout() -> u64 {
    DEFAULT_TITLE_GEN_TIMEOUT_SECS
}
fn default_max_tool_iterations() -> usize {
    DEFAULT_MAX_TOOL_ITERATIONS
}

impl AppConfig {
    /// Load config from a TOML file, then apply env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `~/.chat-gateway/gateway.toml`
    ///
    /// Beyond the generic `GATEWAY_`-prefixed overrides, the specific
    /// env vars named in the external-interfaces spec (`OPENROUTER_*`,
    /// `ATTACHMENTS_*`) are mapped onto their nested config keys directly,
    /// since they don't follow the `GATEWAY_` prefix convention.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: AppConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .merge(Env::raw().only(&["OPENROUTER_API_KEY"]).map(|_| "provider.api_key".into()))
            .merge(Env::raw().only(&["OPENROUTER_BASE_URL"]).map(|_| "provider.base_url".into()))
            .merge(Env::raw().only(&["OPENROUTER_DEFAULT_MODEL"]).map(|_| "provider.default_model".into()))
            .merge(Env::raw().only(&["OPENROUTER_SYSTEM_PROMPT"]).map(|_| "provider.system_prompt".into()))
            .merge(
                Env::raw()
                    .only(&["ATTACHMENTS_MAX_SIZE_BYTES"])
                    .map(|_| "attachments.max_size_bytes".into()),
            )
            .merge(
                Env::raw()
                    .only(&["ATTACHMENTS_RETENTION_DAYS"])
                    .map(|_| "attachments.retention_days".into()),
            )
            .merge(
                Env::raw()
                    .only(&["ATTACHMENTS_BASE_URL"])
                    .map(|_| "attachments.base_url".into()),
            )
            .merge(
                Env::raw()
                    .only(&["ATTACHMENTS_SIGNING_SECRET"])
                    .map(|_| "attachments.signing_secret".into()),
            )
            .merge(
                Env::raw()
                    .only(&["GATEWAY_AUTH_TOKEN"])
                    .map(|_| "server.auth_token".into()),
            )
            .extract()
            .map_err(|e| crate::error::GatewayError::Internal(format!("config: {e}")))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    format!("{}/gateway.toml", default_state_dir())
}
