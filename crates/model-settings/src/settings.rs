//! Active model configuration snapshot service (spec §4.6 "Model settings
//! service").

use crate::error::Result;
use crate::store::AtomicFileStore;
use crate::types::ModelConfigSnapshot;

pub struct ModelSettingsService {
    store: AtomicFileStore<ModelConfigSnapshot>,
}

impl ModelSettingsService {
    pub fn load_or_init(
        path: impl AsRef<std::path::Path>,
        default: ModelConfigSnapshot,
    ) -> Result<Self> {
        Ok(Self {
            store: AtomicFileStore::load_or_init(path, default)?,
        })
    }

    pub async fn get_active(&self) -> std::sync::Arc<ModelConfigSnapshot> {
        self.store.get().await
    }

    pub async fn set_active(&self, snapshot: ModelConfigSnapshot) -> Result<std::sync::Arc<ModelConfigSnapshot>> {
        self.store.set(snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_active_replaces_without_tearing() {
        let dir = tempfile::tempdir().unwrap();
        let service = ModelSettingsService::load_or_init(
            dir.path().join("active.json"),
            ModelConfigSnapshot::new("a"),
        )
        .unwrap();
        assert_eq!(service.get_active().await.model_id, "a");

        service.set_active(ModelConfigSnapshot::new("b")).await.unwrap();
        assert_eq!(service.get_active().await.model_id, "b");
    }
}
