//! Thin wrapper over `object_store` (spec §4.5 "writes blob to object
//! store"). Kept generic over the backend — a local filesystem store in
//! development, S3/GCS/Azure in production — via `Arc<dyn ObjectStore>`.

use std::path::Path as FsPath;
use std::sync::Arc;

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::ObjectStore;

use crate::error::Result;

#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Builds a store rooted at `root` on the local filesystem, creating the
    /// directory if it doesn't exist yet.
    pub fn local(root: &FsPath) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            object_store::Error::Generic {
                store: "LocalFileSystem",
                source: Box::new(e),
            }
        })?;
        let fs = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(fs)))
    }

    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        let path = Path::from(key);
        self.store.put(&path, bytes.into()).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let path = Path::from(key);
        let result = self.store.get(&path).await?;
        Ok(result.bytes().await?)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = Path::from(key);
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_blob_through_a_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::local(dir.path()).unwrap();

        store.put("s1/a1__file.png", Bytes::from_static(b"hello")).await.unwrap();
        let read_back = store.get("s1/a1__file.png").await.unwrap();
        assert_eq!(read_back, Bytes::from_static(b"hello"));

        store.delete("s1/a1__file.png").await.unwrap();
        assert!(store.get("s1/a1__file.png").await.is_err());
    }

    #[tokio::test]
    async fn deleting_a_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::local(dir.path()).unwrap();
        store.delete("does/not/exist").await.unwrap();
    }
}
