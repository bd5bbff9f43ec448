//! Document persistence.
//!
//! [`DocumentStore`] is the content store contract: atomic registration,
//! conditional all-or-nothing status patches, and lookups. The Postgres
//! implementation backs deployments; the in-memory one backs development
//! and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Document, DocumentPatch, DocumentStatus, RegisterRequest};
use crate::types::AppResult;

pub mod memory;
pub mod operations;
pub mod pool;

pub use memory::MemoryDocumentStore;
pub use operations::PgDocumentStore;
pub use pool::*;

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Applied(Document),
    /// The row exists but was not in one of the expected states.
    Stale { current: DocumentStatus },
    /// The status matched but the row records a different job than the
    /// patch expected.
    JobReplaced { current_job: Option<String> },
    NotFound,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new pending document.
    ///
    /// With `request.idempotent`, an existing non-failed document for the
    /// same `(client_id, source_ref)` is returned instead; the lookup and
    /// the insert happen atomically. The flag reports whether a row was
    /// created.
    async fn insert(&self, request: &RegisterRequest) -> AppResult<(Document, bool)>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Document>>;

    /// Apply `patch` only if the current status is one of `expected` and,
    /// when `patch.expected_job` is set, the row still records that job.
    /// Chunks in the patch are written in the same transaction.
    async fn apply_patch(
        &self,
        id: Uuid,
        expected: &[DocumentStatus],
        patch: &DocumentPatch,
    ) -> AppResult<PatchOutcome>;

    /// Newest first.
    async fn list_for_client(&self, client_id: Uuid) -> AppResult<Vec<Document>>;

    /// Documents in one of `statuses` not touched since `updated_before`.
    async fn list_stale(
        &self,
        statuses: &[DocumentStatus],
        updated_before: DateTime<Utc>,
    ) -> AppResult<Vec<Document>>;

    /// Stamp `heartbeat_at` on a processing document still tracking
    /// `job_id`. Returns false once another writer has moved the row on.
    async fn heartbeat(&self, id: Uuid, job_id: &str) -> AppResult<bool>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> AppResult<bool>;

    /// Whether any document of the client still references `source_ref`.
    async fn source_in_use(&self, client_id: Uuid, source_ref: &str) -> AppResult<bool>;

    async fn ping(&self) -> AppResult<()>;

    fn backend(&self) -> &'static str;
}
