use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::utils::Backoff;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub parser: ParserConfig,
    pub pipeline: PipelineConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Unset means the in-memory document store.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub provider: String,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_endpoint: Option<String>,
    /// Base of the publicly resolvable URL of stored objects.
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub max_upload_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub chunk_size: usize,
    /// Total submissions allowed per document, first one included.
    pub max_attempts: u32,
    pub submit_base_delay_ms: u64,
    pub submit_max_delay_ms: u64,
    pub poll_initial_delay_ms: u64,
    pub poll_max_delay_ms: u64,
    pub poll_timeout_ms: u64,
    pub job_timeout_ms: u64,
    /// How long a processing row may go without a heartbeat before another
    /// instance may take its job over.
    pub lease_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    /// Download timeout for linked files that need conversion.
    pub fetch_timeout_secs: u64,
    /// Reject URL submissions that are unreachable or disallowed by robots.txt.
    pub check_url_access: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub directory: Option<String>,
}

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 20 * 1024 * 1024;

pub fn default_allowed_mime_types() -> Vec<String> {
    [
        "application/pdf",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "text/plain",
        "text/markdown",
        "text/csv",
        "text/tab-separated-values",
        "text/html",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_mime_types: default_allowed_mime_types(),
            chunk_size: 1000,
            max_attempts: 5,
            submit_base_delay_ms: 1_000,
            submit_max_delay_ms: 30_000,
            poll_initial_delay_ms: 10_000,
            poll_max_delay_ms: 60_000,
            poll_timeout_ms: 15_000,
            job_timeout_ms: 15 * 60 * 1000,
            lease_timeout_ms: 3 * 60 * 1000,
            sweep_interval_secs: 300,
            fetch_timeout_secs: 60,
            check_url_access: true,
        }
    }
}

impl PipelineConfig {
    pub fn submit_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.submit_base_delay_ms),
            Duration::from_millis(self.submit_max_delay_ms),
        )
    }

    pub fn poll_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.poll_initial_delay_ms),
            Duration::from_millis(self.poll_max_delay_ms),
        )
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Never shorter than the longest gap between two heartbeats of a
    /// healthy tracker.
    pub fn lease_timeout(&self) -> Duration {
        let heartbeat_gap = self.poll_initial_delay_ms.max(self.poll_max_delay_ms)
            + self.poll_timeout_ms;
        Duration::from_millis(self.lease_timeout_ms.max(heartbeat_gap))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid value for {}", key))
}

fn list_var(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = PipelineConfig::default();

        Ok(Self {
            server: ServerConfig {
                port: parse_var("PORT", "3000")?,
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                cors_allowed_origins: list_var(
                    "ALLOWED_ORIGINS",
                    "http://localhost:3000,http://localhost:5173",
                ),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok().filter(|u| !u.is_empty()),
                max_connections: parse_var("DB_MAX_CONNECTIONS", "10")?,
                min_connections: parse_var("DB_MIN_CONNECTIONS", "1")?,
            },
            storage: StorageConfig {
                provider: env::var("STORAGE_PROVIDER").unwrap_or_else(|_| "memory".to_string()),
                s3_bucket: env::var("S3_BUCKET").unwrap_or_else(|_| "client-documents".to_string()),
                s3_region: env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                s3_access_key_id: env::var("AWS_ACCESS_KEY_ID").ok(),
                s3_secret_access_key: env::var("AWS_SECRET_ACCESS_KEY").ok(),
                s3_endpoint: env::var("S3_ENDPOINT").ok(),
                public_base_url: env::var("STORAGE_PUBLIC_BASE_URL").ok(),
            },
            parser: ParserConfig {
                base_url: env::var("PARSER_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:8080/api/parsing".to_string()),
                api_key: env::var("PARSER_API_KEY").unwrap_or_default(),
                request_timeout_secs: parse_var("PARSER_REQUEST_TIMEOUT_SECS", "30")?,
            },
            pipeline: PipelineConfig {
                max_upload_bytes: parse_var(
                    "MAX_UPLOAD_BYTES",
                    &defaults.max_upload_bytes.to_string(),
                )?,
                allowed_mime_types: list_var(
                    "ALLOWED_MIME_TYPES",
                    &defaults.allowed_mime_types.join(","),
                ),
                chunk_size: parse_var("CHUNK_SIZE", &defaults.chunk_size.to_string())?,
                max_attempts: parse_var("MAX_ATTEMPTS", &defaults.max_attempts.to_string())?,
                submit_base_delay_ms: parse_var(
                    "SUBMIT_BASE_DELAY_MS",
                    &defaults.submit_base_delay_ms.to_string(),
                )?,
                submit_max_delay_ms: parse_var(
                    "SUBMIT_MAX_DELAY_MS",
                    &defaults.submit_max_delay_ms.to_string(),
                )?,
                poll_initial_delay_ms: parse_var(
                    "POLL_INITIAL_DELAY_MS",
                    &defaults.poll_initial_delay_ms.to_string(),
                )?,
                poll_max_delay_ms: parse_var(
                    "POLL_MAX_DELAY_MS",
                    &defaults.poll_max_delay_ms.to_string(),
                )?,
                poll_timeout_ms: parse_var(
                    "POLL_TIMEOUT_MS",
                    &defaults.poll_timeout_ms.to_string(),
                )?,
                job_timeout_ms: parse_var(
                    "JOB_TIMEOUT_MS",
                    &defaults.job_timeout_ms.to_string(),
                )?,
                lease_timeout_ms: parse_var(
                    "LEASE_TIMEOUT_MS",
                    &defaults.lease_timeout_ms.to_string(),
                )?,
                sweep_interval_secs: parse_var(
                    "SWEEP_INTERVAL_SECS",
                    &defaults.sweep_interval_secs.to_string(),
                )?,
                fetch_timeout_secs: parse_var(
                    "FETCH_TIMEOUT_SECS",
                    &defaults.fetch_timeout_secs.to_string(),
                )?,
                check_url_access: parse_var(
                    "CHECK_URL_ACCESS",
                    &defaults.check_url_access.to_string(),
                )?,
            },
            log: LogConfig {
                directory: env::var("LOG_DIR").ok(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_upload_bytes, 20 * 1024 * 1024);
        assert!(config.max_attempts > 2);
        assert!(config
            .allowed_mime_types
            .iter()
            .any(|m| m == "application/pdf"));
        assert!(config.job_timeout() > config.poll_timeout());
        assert!(config.job_timeout() > config.lease_timeout());
    }

    #[test]
    fn test_lease_outlasts_the_heartbeat_gap() {
        let config = PipelineConfig {
            poll_initial_delay_ms: 100,
            poll_max_delay_ms: 400,
            poll_timeout_ms: 250,
            lease_timeout_ms: 10,
            ..PipelineConfig::default()
        };
        assert_eq!(config.lease_timeout(), Duration::from_millis(650));

        let config = PipelineConfig {
            lease_timeout_ms: 5_000,
            ..config
        };
        assert_eq!(config.lease_timeout(), Duration::from_millis(5_000));
    }
}
