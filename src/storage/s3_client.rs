// S3-compatible storage adapter

use async_trait::async_trait;
use bytes::Bytes;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use tracing::{debug, info};

use super::StorageAdapter;
use crate::config::StorageConfig;
use crate::types::{AppError, AppResult};

pub struct S3Storage {
    bucket: Bucket,
    public_base: String,
}

impl S3Storage {
    pub fn new(config: &StorageConfig) -> AppResult<Self> {
        let region = match &config.s3_endpoint {
            Some(endpoint) => Region::Custom {
                region: config.s3_region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .s3_region
                .parse::<Region>()
                .map_err(|e| AppError::Storage(format!("Invalid S3 region: {}", e)))?,
        };

        let credentials = Credentials::new(
            config.s3_access_key_id.as_deref(),
            config.s3_secret_access_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|e| AppError::Storage(format!("Invalid S3 credentials: {}", e)))?;

        let mut bucket = Bucket::new(&config.s3_bucket, region, credentials)
            .map_err(|e| AppError::Storage(format!("Invalid S3 bucket: {}", e)))?;
        if config.s3_endpoint.is_some() {
            // MinIO and most self-hosted endpoints need path-style addressing
            bucket = bucket.with_path_style();
        }

        let public_base = config
            .public_base_url
            .clone()
            .unwrap_or_else(|| bucket.url())
            .trim_end_matches('/')
            .to_string();

        info!(bucket = %config.s3_bucket, public_base = %public_base, "S3 storage configured");

        Ok(Self {
            bucket,
            public_base,
        })
    }

    fn public_ref(&self, path: &str) -> String {
        format!("{}/{}", self.public_base, path)
    }
}

fn check_status(operation: &str, path: &str, status: u16) -> AppResult<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else if status == 404 {
        Err(AppError::NotFound(format!("Object {}", path)))
    } else {
        Err(AppError::Storage(format!(
            "S3 {} of {} returned status {}",
            operation, path, status
        )))
    }
}

#[async_trait]
impl StorageAdapter for S3Storage {
    async fn put(&self, path: &str, bytes: Bytes, content_type: &str) -> AppResult<String> {
        let response = self
            .bucket
            .put_object_with_content_type(path, &bytes, content_type)
            .await
            .map_err(|e| AppError::Storage(format!("S3 put of {} failed: {}", path, e)))?;
        check_status("put", path, response.status_code())?;

        debug!(path, size = bytes.len(), "Stored object");
        Ok(self.public_ref(path))
    }

    async fn get(&self, path: &str) -> AppResult<Bytes> {
        let response = self
            .bucket
            .get_object(path)
            .await
            .map_err(|e| AppError::Storage(format!("S3 get of {} failed: {}", path, e)))?;
        check_status("get", path, response.status_code())?;

        Ok(Bytes::copy_from_slice(response.as_slice()))
    }

    async fn delete(&self, path: &str) -> AppResult<()> {
        let response = self
            .bucket
            .delete_object(path)
            .await
            .map_err(|e| AppError::Storage(format!("S3 delete of {} failed: {}", path, e)))?;

        match check_status("delete", path, response.status_code()) {
            Err(AppError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}
