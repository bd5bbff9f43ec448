// Object storage for uploaded and converted documents

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::config::StorageConfig;
use crate::types::{AppError, AppResult};

pub mod s3_client;

pub use s3_client::S3Storage;

/// Durable object storage. `put` returns a reference the parsing service
/// can resolve on its own (a public URL for real backends).
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn put(&self, path: &str, bytes: Bytes, content_type: &str) -> AppResult<String>;

    async fn get(&self, path: &str) -> AppResult<Bytes>;

    async fn delete(&self, path: &str) -> AppResult<()>;
}

/// Build the adapter selected by `STORAGE_PROVIDER`.
pub fn from_config(config: &StorageConfig) -> AppResult<Arc<dyn StorageAdapter>> {
    match config.provider.as_str() {
        "s3" => Ok(Arc::new(S3Storage::new(config)?)),
        "memory" => Ok(Arc::new(MemoryStorage::new(
            config
                .public_base_url
                .clone()
                .unwrap_or_else(|| MemoryStorage::DEFAULT_BASE.to_string()),
        ))),
        other => Err(AppError::Storage(format!(
            "Unknown storage provider '{}', expected 's3' or 'memory'",
            other
        ))),
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Bytes,
    content_type: String,
}

/// Process-local storage for development and tests.
#[derive(Clone)]
pub struct MemoryStorage {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    public_base: String,
}

impl MemoryStorage {
    pub const DEFAULT_BASE: &'static str = "memory://objects";

    pub fn new(public_base: impl Into<String>) -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn content_type(&self, path: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(path)
            .map(|o| o.content_type.clone())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE)
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn put(&self, path: &str, bytes: Bytes, content_type: &str) -> AppResult<String> {
        let mut guard = self.objects.write().await;
        guard.insert(
            path.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(format!("{}/{}", self.public_base, path))
    }

    async fn get(&self, path: &str) -> AppResult<Bytes> {
        let guard = self.objects.read().await;
        guard
            .get(path)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| AppError::NotFound(format!("Object {}", path)))
    }

    async fn delete(&self, path: &str) -> AppResult<()> {
        let mut guard = self.objects.write().await;
        guard.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new("https://files.example.com/");

        let public_ref = storage
            .put("client/a.pdf", Bytes::from_static(b"%PDF-1.5"), "application/pdf")
            .await
            .unwrap();
        assert_eq!(public_ref, "https://files.example.com/client/a.pdf");
        assert_eq!(storage.get("client/a.pdf").await.unwrap(), Bytes::from_static(b"%PDF-1.5"));
        assert_eq!(
            storage.content_type("client/a.pdf").await.as_deref(),
            Some("application/pdf")
        );

        storage.delete("client/a.pdf").await.unwrap();
        assert!(matches!(
            storage.get("client/a.pdf").await,
            Err(AppError::NotFound(_))
        ));
        assert!(storage.is_empty().await);
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let config = StorageConfig {
            provider: "ftp".to_string(),
            s3_bucket: "b".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_access_key_id: None,
            s3_secret_access_key: None,
            s3_endpoint: None,
            public_base_url: None,
        };
        assert!(matches!(from_config(&config), Err(AppError::Storage(_))));
    }
}
