use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Recognized provider-override keys (spec §3 "Model Configuration Snapshot":
/// "map of option → value from an enumerated set: routing sort, data-collection
/// policy, allow-fallbacks, require-parameters"). Kept as an enum rather than
/// a bare string map so an unrecognized key is a deserialization error, not a
/// silently-ignored typo reaching the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOverrideKey {
    RoutingSort,
    DataCollectionPolicy,
    AllowFallbacks,
    RequireParameters,
}

/// The durable active model configuration (spec §3 "Model Configuration
/// Snapshot"). Immutable once issued to a provider request — a mutation
/// produces a new snapshot via [`ModelSettingsService::set_active`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfigSnapshot {
    pub model_id: String,
    #[serde(default)]
    pub provider_overrides: HashMap<ProviderOverrideKey, serde_json::Value>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub system_prompt: Option<String>,
    pub updated_at: String,
}

impl ModelConfigSnapshot {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            provider_overrides: HashMap::new(),
            parameters: HashMap::new(),
            system_prompt: None,
            updated_at: gateway_core::time::now_rfc3339(),
        }
    }
}

/// Named, durable snapshot of model config plus tool-server configuration
/// (spec §3 "Preset"). `tool_server_configs` is kept as opaque JSON here —
/// `model-settings` has no dependency on `tool-aggregator`'s
/// `ToolServerConfig` type, so the caller applying a preset (which does
/// depend on both) deserializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub model_id: String,
    #[serde(default)]
    pub provider_overrides: HashMap<ProviderOverrideKey, serde_json::Value>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tool_server_configs: Vec<serde_json::Value>,
}

impl Preset {
    pub fn to_snapshot(&self) -> ModelConfigSnapshot {
        ModelConfigSnapshot {
            model_id: self.model_id.clone(),
            provider_overrides: self.provider_overrides.clone(),
            parameters: self.parameters.clone(),
            system_prompt: self.system_prompt.clone(),
            updated_at: gateway_core::time::now_rfc3339(),
        }
    }
}
