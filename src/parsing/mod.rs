//! External text-extraction service.
//!
//! The pipeline only sees [`ParsingService`] and the discriminated
//! [`JobStatusReport`]; wire payloads are validated into that shape at the
//! boundary so nothing downstream handles "completed without content".

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{AppError, AppResult};

pub mod client;

pub use client::HttpParsingClient;

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatusReport {
    Pending,
    Processing,
    Completed { content: String, metadata: Value },
    Failed { error: String, retryable: bool },
}

impl JobStatusReport {
    /// Build a report from the service's raw status fields.
    ///
    /// Unknown statuses and a completed job without content are permanent
    /// service errors.
    pub fn from_wire(
        status: &str,
        content: Option<String>,
        error: Option<String>,
        metadata: Option<Value>,
    ) -> AppResult<Self> {
        let status = status.trim().to_ascii_lowercase();
        if is_completed_status(&status) {
            return match content {
                Some(content) => Ok(JobStatusReport::Completed {
                    content,
                    metadata: metadata.unwrap_or(Value::Null),
                }),
                None => Err(AppError::PermanentService(
                    "Parsing service reported completion without content".to_string(),
                )),
            };
        }

        match status.as_str() {
            "pending" | "queued" | "submitted" => Ok(JobStatusReport::Pending),
            "processing" | "running" | "in_progress" | "started" => Ok(JobStatusReport::Processing),
            "failed" | "error" | "cancelled" | "canceled" => {
                let error = error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "Parsing failed without an error message".to_string());
                let retryable = looks_transient(&error);
                Ok(JobStatusReport::Failed { error, retryable })
            }
            other => Err(AppError::PermanentService(format!(
                "Parsing service returned unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Whether a raw status string means the job finished successfully.
pub fn is_completed_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "completed" | "success" | "succeeded" | "done"
    )
}

/// Submit documents for extraction and poll their jobs.
#[async_trait]
pub trait ParsingService: Send + Sync {
    /// Start a job for the document at `document_ref`. Returns the job handle.
    async fn submit_job(&self, document_ref: &str, document_id: &str) -> AppResult<String>;

    async fn get_job_status(&self, job_id: &str) -> AppResult<JobStatusReport>;
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "temporar",
    "rate limit",
    "too many requests",
    "unavailable",
    "overloaded",
    "try again",
    "connection reset",
    "429",
    "502",
    "503",
    "504",
];

/// Whether a service-reported failure message reads like a transient fault.
pub fn looks_transient(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_are_case_insensitive() {
        assert_eq!(
            JobStatusReport::from_wire("PENDING", None, None, None).unwrap(),
            JobStatusReport::Pending
        );
        assert_eq!(
            JobStatusReport::from_wire("In_Progress", None, None, None).unwrap(),
            JobStatusReport::Processing
        );
        assert_eq!(
            JobStatusReport::from_wire("SUCCESS", Some("text".into()), None, None).unwrap(),
            JobStatusReport::Completed {
                content: "text".into(),
                metadata: Value::Null
            }
        );
    }

    #[test]
    fn test_completed_without_content_is_rejected() {
        assert!(matches!(
            JobStatusReport::from_wire("completed", None, None, None),
            Err(AppError::PermanentService(_))
        ));
    }

    #[test]
    fn test_failures_are_classified() {
        let report =
            JobStatusReport::from_wire("ERROR", None, Some("Upstream timeout, try again".into()), None)
                .unwrap();
        assert_eq!(
            report,
            JobStatusReport::Failed {
                error: "Upstream timeout, try again".into(),
                retryable: true
            }
        );

        let report =
            JobStatusReport::from_wire("failed", None, Some("Document is encrypted".into()), None)
                .unwrap();
        assert!(matches!(report, JobStatusReport::Failed { retryable: false, .. }));

        let report = JobStatusReport::from_wire("failed", None, None, None).unwrap();
        assert!(matches!(report, JobStatusReport::Failed { ref error, .. } if !error.is_empty()));
    }

    #[test]
    fn test_unknown_status_is_a_permanent_error() {
        assert!(matches!(
            JobStatusReport::from_wire("exploded", None, None, None),
            Err(AppError::PermanentService(_))
        ));
    }
}
