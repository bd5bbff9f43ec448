// HTTP client for the parsing service

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{is_completed_status, JobStatusReport, ParsingService};
use crate::config::ParserConfig;
use crate::types::{AppError, AppResult};

const MAX_ERROR_BODY: usize = 500;

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    url: &'a str,
    metadata: SubmitMetadata<'a>,
}

#[derive(Debug, Serialize)]
struct SubmitMetadata<'a> {
    document_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(alias = "job_id", alias = "jobId")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
    #[serde(default, alias = "error_message", alias = "message")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    #[serde(default, alias = "content", alias = "text")]
    markdown: Option<String>,
    #[serde(default, alias = "job_metadata")]
    metadata: Option<Value>,
}

/// Parsing service over HTTP:
///
/// - `POST {base}/url` with `{url, metadata}` starts a job
/// - `GET {base}/job/{id}` reports its status
/// - `GET {base}/job/{id}/result/markdown` returns the extracted text
pub struct HttpParsingClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpParsingClient {
    pub fn new(config: &ParserConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder, context: &str) -> AppResult<Response> {
        let request = if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        };

        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| send_error(context, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(context, status, &body))
    }

    async fn fetch_result(&self, job_id: &str) -> AppResult<ResultResponse> {
        let response = self
            .send(
                self.client.get(self.url(&format!("job/{}/result/markdown", job_id))),
                "result",
            )
            .await?;

        response
            .json()
            .await
            .map_err(|e| AppError::PermanentService(format!("Malformed result payload: {}", e)))
    }
}

/// Network-level failures: timeouts and connection problems are worth a
/// retry, a response that cannot be decoded is not.
fn send_error(context: &str, error: reqwest::Error) -> AppError {
    if error.is_decode() || error.is_builder() {
        AppError::PermanentService(format!("Parsing {} request failed: {}", context, error))
    } else {
        AppError::TransientService(format!("Parsing {} request failed: {}", context, error))
    }
}

fn status_error(context: &str, status: StatusCode, body: &str) -> AppError {
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = format!("Parsing {} returned {}: {}", context, status, body.trim());

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        AppError::TransientService(message)
    } else {
        AppError::PermanentService(message)
    }
}

/// Hide credential-looking query values, e.g. signed storage URLs.
pub fn mask_url(raw: &str) -> String {
    const SENSITIVE: &[&str] = &["key", "token", "auth", "password", "secret", "credential", "signature", "sig"];

    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    if url.query().is_none() {
        return raw.to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let lower = k.to_ascii_lowercase();
            let sensitive = SENSITIVE.iter().any(|s| lower.contains(s));
            let value = if sensitive && v.chars().count() > 4 {
                let head: String = v.chars().take(2).collect();
                let tail: String = v.chars().rev().take(2).collect::<Vec<_>>().into_iter().rev().collect();
                format!("{}***{}", head, tail)
            } else {
                v.into_owned()
            };
            (k.into_owned(), value)
        })
        .collect();

    url.query_pairs_mut().clear().extend_pairs(pairs);
    url.to_string()
}

#[async_trait]
impl ParsingService for HttpParsingClient {
    async fn submit_job(&self, document_ref: &str, document_id: &str) -> AppResult<String> {
        info!(document_id, document_ref = %mask_url(document_ref), "Submitting document for parsing");

        let body = SubmitRequest {
            url: document_ref,
            metadata: SubmitMetadata { document_id },
        };
        let response = self
            .send(self.client.post(self.url("url")).json(&body), "submit")
            .await?;

        let submitted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| AppError::PermanentService(format!("Malformed submit response: {}", e)))?;

        if submitted.id.trim().is_empty() {
            return Err(AppError::PermanentService(
                "Parsing service returned an empty job id".to_string(),
            ));
        }

        Ok(submitted.id)
    }

    async fn get_job_status(&self, job_id: &str) -> AppResult<JobStatusReport> {
        let response = self
            .send(self.client.get(self.url(&format!("job/{}", job_id))), "status")
            .await?;

        let job: JobResponse = response
            .json()
            .await
            .map_err(|e| AppError::PermanentService(format!("Malformed status payload: {}", e)))?;

        debug!(job_id, status = %job.status, "Polled parsing job");

        if is_completed_status(&job.status) {
            let result = self.fetch_result(job_id).await?;
            return JobStatusReport::from_wire(&job.status, result.markdown, None, result.metadata);
        }

        JobStatusReport::from_wire(&job.status, None, job.error, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn client(base_url: &str) -> HttpParsingClient {
        HttpParsingClient::new(&ParserConfig {
            base_url: base_url.to_string(),
            api_key: "test-key".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_returns_job_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/url")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::PartialJson(json!({
                "url": "https://cdn.example.com/a.pdf",
                "metadata": { "document_id": "doc-1" }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": "job-123", "status": "PENDING"}"#)
            .create_async()
            .await;

        let job_id = client(&server.url())
            .submit_job("https://cdn.example.com/a.pdf", "doc-1")
            .await
            .unwrap();

        assert_eq!(job_id, "job-123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_submit_errors_are_classified_by_status() {
        let mut server = mockito::Server::new_async().await;
        let parser = client(&server.url());

        for (status, transient) in [(503, true), (429, true), (408, true), (400, false), (404, false)] {
            let mock = server
                .mock("POST", "/url")
                .with_status(status)
                .with_body("nope")
                .create_async()
                .await;

            let error = parser.submit_job("https://x.com/a.pdf", "doc").await.unwrap_err();
            assert_eq!(error.is_transient(), transient, "status {}", status);
            mock.remove_async().await;
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        let error = client("http://127.0.0.1:1")
            .submit_job("https://x.com/a.pdf", "doc")
            .await
            .unwrap_err();
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_submit_response_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/url")
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let error = client(&server.url())
            .submit_job("https://x.com/a.pdf", "doc")
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::PermanentService(_)));
    }

    #[tokio::test]
    async fn test_completed_job_fetches_markdown() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/job/job-9")
            .with_status(200)
            .with_body(r#"{"id": "job-9", "status": "SUCCESS"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/job/job-9/result/markdown")
            .with_status(200)
            .with_body(r##"{"markdown": "# Title\n\nBody", "job_metadata": {"pages": 1}}"##)
            .create_async()
            .await;

        let report = client(&server.url()).get_job_status("job-9").await.unwrap();
        assert_eq!(
            report,
            JobStatusReport::Completed {
                content: "# Title\n\nBody".to_string(),
                metadata: json!({"pages": 1}),
            }
        );
    }

    #[tokio::test]
    async fn test_pending_and_failed_jobs() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/job/p")
            .with_status(200)
            .with_body(r#"{"status": "PENDING"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/job/f")
            .with_status(200)
            .with_body(r#"{"status": "ERROR", "error_message": "Unsupported encryption"}"#)
            .create_async()
            .await;

        let parser = client(&server.url());
        assert_eq!(parser.get_job_status("p").await.unwrap(), JobStatusReport::Pending);
        assert_eq!(
            parser.get_job_status("f").await.unwrap(),
            JobStatusReport::Failed {
                error: "Unsupported encryption".to_string(),
                retryable: false
            }
        );
    }

    #[test]
    fn test_mask_url_hides_credentials() {
        let masked = mask_url("https://s3.example.com/a.pdf?X-Amz-Signature=abcdef123456&v=2");
        assert!(masked.contains("ab***56"));
        assert!(masked.contains("v=2"));
        assert!(!masked.contains("abcdef123456"));

        assert_eq!(mask_url("https://example.com/a.pdf"), "https://example.com/a.pdf");
    }
}
