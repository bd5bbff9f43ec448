// Download of linked documents and reachability checks for URL sources

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{header, Client, StatusCode, Url};
use tracing::debug;

use crate::normalizer::InputFile;
use crate::types::{AppError, AppResult};

const FALLBACK_FILENAME: &str = "downloaded-document";

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Download `url`, refusing bodies larger than `max_bytes`.
    async fn fetch(&self, url: &str, max_bytes: u64) -> AppResult<InputFile>;

    /// Fail with a validation error when `url` does not answer with a
    /// success status or the site's robots.txt disallows it.
    async fn check_access(&self, url: &str) -> AppResult<()>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl HttpFetcher {
    /// Status of `url`, asking with HEAD and falling back to GET for
    /// servers that refuse HEAD.
    async fn access_status(&self, url: &Url) -> AppResult<StatusCode> {
        let head = self.client.head(url.clone()).send().await;
        match head {
            Ok(response)
                if response.status() != StatusCode::METHOD_NOT_ALLOWED
                    && response.status() != StatusCode::NOT_IMPLEMENTED =>
            {
                return Ok(response.status());
            }
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "HEAD refused, retrying with GET");
            }
            Err(e) => debug!(url = %url, error = %e, "HEAD failed, retrying with GET"),
        }

        self.client
            .get(url.clone())
            .send()
            .await
            .map(|response| response.status())
            .map_err(|e| AppError::Validation(format!("URL {} is not reachable: {}", url, e)))
    }

    /// Whether the site's robots.txt keeps crawlers away from `url`. A
    /// missing or unreadable robots.txt allows everything.
    async fn robots_disallow(&self, url: &Url) -> bool {
        let Ok(robots_url) = url.join("/robots.txt") else {
            return false;
        };
        let response = match self.client.get(robots_url).send().await {
            Ok(response) if response.status().is_success() => response,
            _ => return false,
        };
        let Ok(body) = response.text().await else {
            return false;
        };

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        robots_disallows(&body, &target)
    }
}

/// Evaluate the `User-agent: *` rules of a robots.txt against `path`. The
/// longest matching prefix wins, `Allow` on a tie.
fn robots_disallows(robots: &str, path: &str) -> bool {
    let mut in_wildcard_group = false;
    let mut group_has_rules = false;
    let mut best: Option<(usize, bool)> = None;

    for line in robots.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match key.as_str() {
            "user-agent" => {
                if group_has_rules {
                    in_wildcard_group = false;
                    group_has_rules = false;
                }
                if value == "*" {
                    in_wildcard_group = true;
                }
            }
            "allow" | "disallow" => {
                group_has_rules = true;
                if !in_wildcard_group || value.is_empty() || !path.starts_with(value) {
                    continue;
                }
                let allowed = key == "allow";
                match best {
                    Some((len, prev_allowed))
                        if len > value.len() || (len == value.len() && prev_allowed) => {}
                    _ => best = Some((value.len(), allowed)),
                }
            }
            _ => {}
        }
    }

    matches!(best, Some((_, false)))
}

fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| name.len() >= 3)
        .map(|name| name.to_string())
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, max_bytes: u64) -> AppResult<InputFile> {
        let parsed = Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL '{}': {}", url, e)))?;

        let mut response = self
            .client
            .get(parsed.clone())
            .send()
            .await
            .map_err(|e| AppError::TransientService(format!("Download of {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("Download of {} returned {}", url, status);
            return Err(
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    AppError::TransientService(message)
                } else {
                    AppError::PermanentService(message)
                },
            );
        }

        if let Some(length) = response.content_length() {
            if length > max_bytes {
                return Err(AppError::FileTooLarge {
                    size: length,
                    limit: max_bytes,
                });
            }
        }

        let mime_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AppError::TransientService(format!("Download of {} failed: {}", url, e)))?
        {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > max_bytes {
                return Err(AppError::FileTooLarge {
                    size: body.len() as u64,
                    limit: max_bytes,
                });
            }
        }

        let bytes: Bytes = body.freeze();
        debug!(url, size = bytes.len(), mime_type = %mime_type, "Downloaded source");

        Ok(InputFile::new(filename_from_url(&parsed), mime_type, bytes))
    }

    async fn check_access(&self, url: &str) -> AppResult<()> {
        let parsed = Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL '{}': {}", url, e)))?;

        let status = self.access_status(&parsed).await?;
        if !status.is_success() {
            return Err(AppError::Validation(format!(
                "URL {} is not reachable: HTTP {}",
                url,
                status.as_u16()
            )));
        }

        if self.robots_disallow(&parsed).await {
            return Err(AppError::Validation(format!(
                "URL {} is disallowed by the site's robots.txt",
                url
            )));
        }

        debug!(url, status = %status, "URL source is reachable");
        Ok(())
    }
}
