use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pipeline: Pipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Upload,
    Url,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Upload => "upload",
            SourceKind::Url => "url",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(SourceKind::Upload),
            "url" => Ok(SourceKind::Url),
            other => Err(format!("unknown source kind: {}", other)),
        }
    }
}

/// Lifecycle of a Document.
///
/// `pending -> converting? -> processing -> completed | failed`, with an
/// explicit retry edge `failed -> processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Converting,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub const ACTIVE: [DocumentStatus; 3] = [
        DocumentStatus::Pending,
        DocumentStatus::Converting,
        DocumentStatus::Processing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Converting => "converting",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }

    /// Legal edges of the lifecycle. Self-edges record progress without
    /// moving the document; `failed -> failed` replaces the error after a
    /// retry that failed again.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Converting)
                | (Pending, Processing)
                | (Pending, Failed)
                | (Converting, Converting)
                | (Converting, Processing)
                | (Converting, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
                | (Failed, Failed)
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "converting" => Ok(DocumentStatus::Converting),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status: {}", other)),
        }
    }
}

/// A retrieval-sized segment of extracted text. `id` is the position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub client_id: Uuid,
    pub source_kind: SourceKind,
    pub source_ref: String,
    /// Reference handed to the parsing service when it differs from `source_ref`.
    pub canonical_ref: Option<String>,
    pub mime_type: String,
    pub document_type: String,
    pub status: DocumentStatus,
    pub content: Option<String>,
    pub chunks: Option<Vec<Chunk>>,
    pub error: Option<String>,
    pub job_id: Option<String>,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last proof of life from the process polling `job_id`.
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(request: &RegisterRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_id: request.client_id,
            source_kind: request.source_kind,
            source_ref: request.source_ref.clone(),
            canonical_ref: request.canonical_ref.clone(),
            mime_type: request.mime_type.clone(),
            document_type: request.document_type.clone(),
            status: DocumentStatus::Pending,
            content: None,
            chunks: None,
            error: None,
            job_id: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
            heartbeat_at: None,
        }
    }

    /// Latest write or heartbeat. A flow working on the document keeps this
    /// fresh; once it ages past the lease the document is up for recovery.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.heartbeat_at
            .map_or(self.updated_at, |beat| beat.max(self.updated_at))
    }

    /// The reference the parsing service should fetch.
    pub fn parse_ref(&self) -> &str {
        self.canonical_ref.as_deref().unwrap_or(&self.source_ref)
    }

    /// Apply an already validated patch in place.
    pub fn apply(&mut self, patch: &DocumentPatch) {
        if self.status == DocumentStatus::Failed && patch.status != DocumentStatus::Failed {
            self.error = None;
        }
        self.status = patch.status;
        if let Some(content) = &patch.content {
            self.content = Some(content.clone());
        }
        if let Some(chunks) = &patch.chunks {
            self.chunks = Some(chunks.clone());
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        if let Some(job_id) = &patch.job_id {
            self.job_id = Some(job_id.clone());
        }
        if let Some(attempt) = patch.attempt {
            self.attempt = attempt;
        }
        if let Some(canonical_ref) = &patch.canonical_ref {
            self.canonical_ref = Some(canonical_ref.clone());
        }
        if let Some(mime_type) = &patch.mime_type {
            self.mime_type = mime_type.clone();
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub client_id: Uuid,
    pub source_kind: SourceKind,
    pub source_ref: String,
    pub canonical_ref: Option<String>,
    pub mime_type: String,
    pub document_type: String,
    /// Return the active document for `(client_id, source_ref)` instead of
    /// creating a duplicate.
    pub idempotent: bool,
}

/// A single all-or-nothing write against a Document row.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPatch {
    pub status: DocumentStatus,
    pub content: Option<String>,
    pub chunks: Option<Vec<Chunk>>,
    pub error: Option<String>,
    pub job_id: Option<String>,
    pub attempt: Option<u32>,
    pub canonical_ref: Option<String>,
    pub mime_type: Option<String>,
    /// Apply only while the row still records this job.
    pub expected_job: Option<String>,
}

impl DocumentPatch {
    pub fn status(status: DocumentStatus) -> Self {
        Self {
            status,
            content: None,
            chunks: None,
            error: None,
            job_id: None,
            attempt: None,
            canonical_ref: None,
            mime_type: None,
            expected_job: None,
        }
    }

    pub fn processing(job_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            job_id: Some(job_id.into()),
            attempt: Some(attempt),
            ..Self::status(DocumentStatus::Processing)
        }
    }

    pub fn completed(content: String, chunks: Vec<Chunk>) -> Self {
        Self {
            content: Some(content),
            chunks: Some(chunks),
            ..Self::status(DocumentStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(DocumentStatus::Failed)
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_canonical_ref(mut self, canonical_ref: impl Into<String>) -> Self {
        self.canonical_ref = Some(canonical_ref.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn expecting_job(mut self, job_id: impl Into<String>) -> Self {
        self.expected_job = Some(job_id.into());
        self
    }
}

/// In-memory tracking entry for a submitted parse job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingJob {
    pub job_id: String,
    pub document_id: Uuid,
    pub attempt: u32,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl ProcessingJob {
    pub fn new(job_id: impl Into<String>, document_id: Uuid, attempt: u32) -> Self {
        Self {
            job_id: job_id.into(),
            document_id,
            attempt,
            submitted_at: Utc::now(),
            last_polled_at: None,
        }
    }
}

// API Request/Response types

#[derive(Debug, Deserialize)]
pub struct UrlSourceRequest {
    pub url: String,
    pub idempotent: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub idempotent: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DocumentQuery {
    /// Long-poll for a terminal status, up to this many seconds.
    pub wait_secs: Option<u64>,
}

/// Document as shown to the admin UI; chunks are served separately.
#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub client_id: Uuid,
    pub source_kind: SourceKind,
    pub source_ref: String,
    pub mime_type: String,
    pub document_type: String,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Document> for DocumentResponse {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            client_id: doc.client_id,
            source_kind: doc.source_kind,
            source_ref: doc.source_ref,
            mime_type: doc.mime_type,
            document_type: doc.document_type,
            status: doc.status,
            content: doc.content,
            chunk_count: doc.chunks.as_ref().map(|c| c.len()),
            error: doc.error,
            attempt: doc.attempt,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChunksResponse {
    pub document_id: Uuid,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub database: String,
    pub active_jobs: usize,
}
