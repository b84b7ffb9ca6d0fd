//! Preset persistence and atomic `apply` (spec §4.6 "Preset service").

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{instrument, warn};

use crate::error::{ModelSettingsError, Result};
use crate::settings::ModelSettingsService;
use crate::store::AtomicFileStore;
use crate::types::{ModelConfigSnapshot, Preset};

pub struct PresetService {
    presets: AtomicFileStore<HashMap<String, Preset>>,
    tool_configs: AtomicFileStore<Vec<serde_json::Value>>,
    model_settings: Arc<ModelSettingsService>,
}

impl PresetService {
    pub fn load_or_init(
        presets_path: impl AsRef<std::path::Path>,
        tool_configs_path: impl AsRef<std::path::Path>,
        model_settings: Arc<ModelSettingsService>,
    ) -> Result<Self> {
        Ok(Self {
            presets: AtomicFileStore::load_or_init(presets_path, HashMap::new())?,
            tool_configs: AtomicFileStore::load_or_init(tool_configs_path, Vec::new())?,
            model_settings,
        })
    }

    pub async fn list(&self) -> Vec<Preset> {
        let mut presets: Vec<Preset> = self.presets.get().await.values().cloned().collect();
        presets.sort_by(|a, b| a.name.cmp(&b.name));
        presets
    }

    pub async fn get(&self, name: &str) -> Option<Preset> {
        self.presets.get().await.get(name).cloned()
    }

    #[instrument(skip(self, preset))]
    pub async fn save(&self, preset: Preset) -> Result<()> {
        let mut presets = (*self.presets.get().await).clone();
        presets.insert(preset.name.clone(), preset);
        self.presets.set(presets).await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut presets = (*self.presets.get().await).clone();
        presets
            .remove(name)
            .ok_or_else(|| ModelSettingsError::PresetNotFound(name.to_string()))?;
        self.presets.set(presets).await?;
        Ok(())
    }

    /// Replaces active model settings and the persisted tool-server config
    /// list. Rolls back to the prior state if either half fails (spec §4.6:
    /// "If either step fails, the service rolls back to the prior state").
    ///
    /// The caller is responsible for signaling the aggregator to `refresh`
    /// with [`PresetService::current_tool_configs`] afterward — this crate
    /// has no dependency on `tool-aggregator`.
    #[instrument(skip(self))]
    pub async fn apply(&self, name: &str) -> Result<ModelConfigSnapshot> {
        let preset = self
            .get(name)
            .await
            .ok_or_else(|| ModelSettingsError::PresetNotFound(name.to_string()))?;

        let prior_snapshot = self.model_settings.get_active().await;
        let prior_tool_configs = (*self.tool_configs.get().await).clone();

        let new_snapshot = preset.to_snapshot();
        if let Err(e) = self.model_settings.set_active(new_snapshot).await {
            return Err(e);
        }

        if let Err(e) = self.tool_configs.set(preset.tool_server_configs.clone()).await {
            warn!(preset = name, error = %e, "rolling back model settings after tool-config write failure");
            if let Err(rollback_err) = self.model_settings.set_active((*prior_snapshot).clone()).await {
                warn!(error = %rollback_err, "rollback of model settings also failed");
            }
            let _ = self.tool_configs.set(prior_tool_configs).await;
            return Err(e);
        }

        Ok((*self.model_settings.get_active().await).clone())
    }

    pub async fn current_tool_configs(&self) -> Vec<serde_json::Value> {
        (*self.tool_configs.get().await).clone()
    }

    /// Persists a new tool-server config list outside of a preset `apply`
    /// (spec §6 `PUT /api/mcp/servers`). The caller is responsible for
    /// signaling the aggregator to `refresh` afterward.
    pub async fn set_tool_configs(&self, configs: Vec<serde_json::Value>) -> Result<()> {
        self.tool_configs.set(configs).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_preset(name: &str) -> Preset {
        Preset {
            name: name.to_string(),
            model_id: "openai/gpt-4o".to_string(),
            provider_overrides: Default::default(),
            parameters: Default::default(),
            system_prompt: Some("Be helpful.".to_string()),
            tool_server_configs: vec![serde_json::json!({"id": "calendar"})],
        }
    }

    async fn harness() -> (tempfile::TempDir, PresetService) {
        let dir = tempfile::tempdir().unwrap();
        let model_settings = Arc::new(
            ModelSettingsService::load_or_init(
                dir.path().join("active.json"),
                ModelConfigSnapshot::new("openai/gpt-4o-mini"),
            )
            .unwrap(),
        );
        let service = PresetService::load_or_init(
            dir.path().join("presets.json"),
            dir.path().join("tool_configs.json"),
            model_settings,
        )
        .unwrap();
        (dir, service)
    }

    #[tokio::test]
    async fn apply_replaces_active_model_and_tool_configs() {
        let (_dir, service) = harness().await;
        service.save(test_preset("work")).await.unwrap();

        let snapshot = service.apply("work").await.unwrap();
        assert_eq!(snapshot.model_id, "openai/gpt-4o");
        assert_eq!(service.current_tool_configs().await.len(), 1);
    }

    #[tokio::test]
    async fn apply_unknown_preset_errors() {
        let (_dir, service) = harness().await;
        let err = service.apply("missing").await.unwrap_err();
        assert!(matches!(err, ModelSettingsError::PresetNotFound(_)));
    }

    #[tokio::test]
    async fn apply_rolls_back_active_model_when_tool_config_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let model_settings = Arc::new(
            ModelSettingsService::load_or_init(
                dir.path().join("active.json"),
                ModelConfigSnapshot::new("openai/gpt-4o-mini"),
            )
            .unwrap(),
        );

        let tools_dir = dir.path().join("tools");
        let service = PresetService::load_or_init(
            dir.path().join("presets.json"),
            tools_dir.join("tool_configs.json"),
            model_settings,
        )
        .unwrap();
        service.save(test_preset("work")).await.unwrap();

        // Knock out the tool-configs directory after construction: replace it
        // with a plain file, so the atomic write's temp-file-in-parent step
        // can never succeed (spec S6: a failed apply must leave the prior
        // model active).
        std::fs::remove_dir_all(&tools_dir).unwrap();
        std::fs::write(&tools_dir, b"not a directory").unwrap();

        let err = service.apply("work").await.unwrap_err();
        assert!(matches!(err, ModelSettingsError::AtomicWrite(_)));

        let active = service.model_settings.get_active().await;
        assert_eq!(active.model_id, "openai/gpt-4o-mini");
    }
}
