//! Source registrar: the only writer of Document rows.
//!
//! Every status change goes through [`SourceRegistrar::update_status`],
//! which validates the patch shape, restricts the caller's expected states
//! to those with a legal edge into the target status, and lets the store
//! perform a single conditional write. A write that finds the document in
//! any other state is rejected as stale.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{DocumentStore, PatchOutcome};
use crate::intake::converted_object_path;
use crate::models::{Document, DocumentPatch, DocumentStatus, RegisterRequest, SourceKind};
use crate::pipeline::StatusNotifier;
use crate::storage::StorageAdapter;
use crate::types::{AppError, AppResult};

#[derive(Clone)]
pub struct SourceRegistrar {
    store: Arc<dyn DocumentStore>,
    storage: Arc<dyn StorageAdapter>,
    notifier: StatusNotifier,
}

impl SourceRegistrar {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        storage: Arc<dyn StorageAdapter>,
        notifier: StatusNotifier,
    ) -> Self {
        Self {
            store,
            storage,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Create a pending Document, or with `idempotent` return the active one
    /// already registered for the same source.
    pub async fn register(&self, request: RegisterRequest) -> AppResult<(Document, bool)> {
        if request.source_ref.trim().is_empty() {
            return Err(AppError::Validation("Source reference is empty".to_string()));
        }

        let (doc, created) = self.store.insert(&request).await?;

        if created {
            info!(
                document_id = %doc.id,
                client_id = %doc.client_id,
                source_kind = %doc.source_kind,
                document_type = %doc.document_type,
                "Registered document"
            );
            self.notifier.publish(doc.id, doc.status).await;
        } else {
            debug!(
                document_id = %doc.id,
                status = %doc.status,
                "Returning existing document for idempotent registration"
            );
        }

        Ok((doc, created))
    }

    /// Atomically move a Document to `patch.status`, provided it is currently
    /// in one of `expected` and the edge is legal. Fails with `Conflict` when
    /// the document has moved on.
    pub async fn update_status(
        &self,
        document_id: Uuid,
        expected: &[DocumentStatus],
        patch: DocumentPatch,
    ) -> AppResult<Document> {
        validate_patch(&patch)?;

        let allowed: Vec<DocumentStatus> = expected
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(patch.status))
            .collect();
        if allowed.is_empty() {
            return Err(AppError::Conflict(format!(
                "No legal transition from {:?} to {}",
                expected, patch.status
            )));
        }

        match self.store.apply_patch(document_id, &allowed, &patch).await? {
            PatchOutcome::Applied(doc) => {
                debug!(
                    document_id = %doc.id,
                    status = %doc.status,
                    attempt = doc.attempt,
                    "Document status updated"
                );
                self.notifier.publish(doc.id, doc.status).await;
                Ok(doc)
            }
            PatchOutcome::Stale { current } => {
                warn!(
                    document_id = %document_id,
                    current = %current,
                    target = %patch.status,
                    "Rejected stale status update"
                );
                Err(AppError::Conflict(format!(
                    "Document {} is {}, cannot move to {}",
                    document_id, current, patch.status
                )))
            }
            PatchOutcome::JobReplaced { current_job } => {
                warn!(
                    document_id = %document_id,
                    expected_job = ?patch.expected_job,
                    current_job = ?current_job,
                    "Rejected update for a replaced parse job"
                );
                Err(AppError::Conflict(format!(
                    "Document {} no longer tracks job {}",
                    document_id,
                    patch.expected_job.as_deref().unwrap_or_default()
                )))
            }
            PatchOutcome::NotFound => {
                Err(AppError::NotFound(format!("Document {}", document_id)))
            }
        }
    }

    /// Record that `job_id` is still being polled. False means the document
    /// has moved on and the caller no longer owns it.
    pub async fn heartbeat(&self, document_id: Uuid, job_id: &str) -> AppResult<bool> {
        self.store.heartbeat(document_id, job_id).await
    }

    pub async fn get_document(&self, document_id: Uuid) -> AppResult<Document> {
        self.store
            .get(document_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Document {}", document_id)))
    }

    pub async fn list_for_client(&self, client_id: Uuid) -> AppResult<Vec<Document>> {
        self.store.list_for_client(client_id).await
    }

    /// Delete a terminal Document, and its stored object unless another
    /// document of the client still points at it.
    pub async fn remove(&self, document_id: Uuid) -> AppResult<()> {
        let doc = self.get_document(document_id).await?;
        if !doc.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "Document {} is still {}",
                document_id, doc.status
            )));
        }

        self.store.delete(document_id).await?;
        self.notifier.unregister(document_id).await;

        if let Some(path) = stored_object_path(&doc) {
            // uploads are content addressed, a re-upload shares the object
            let shared = doc.source_kind == SourceKind::Upload
                && self.store.source_in_use(doc.client_id, &doc.source_ref).await?;
            if shared {
                debug!(document_id = %doc.id, path = %path, "Stored object still referenced, keeping it");
            } else if let Err(e) = self.storage.delete(&path).await {
                warn!(document_id = %doc.id, path = %path, error = %e, "Failed to delete stored object");
            }
        }

        info!(document_id = %document_id, "Removed document");
        Ok(())
    }
}

/// Storage path owned by the document, if any: the upload itself, or the
/// converted PDF of a URL source.
fn stored_object_path(doc: &Document) -> Option<String> {
    match doc.source_kind {
        SourceKind::Upload => Some(doc.source_ref.clone()),
        SourceKind::Url => {
            let path = converted_object_path(doc.client_id, doc.id);
            doc.canonical_ref
                .as_deref()
                .is_some_and(|r| r.ends_with(&path))
                .then_some(path)
        }
    }
}

/// Content and chunks only travel with `completed`, an error only with
/// `failed`.
fn validate_patch(patch: &DocumentPatch) -> AppResult<()> {
    let carries_result = patch.content.is_some() || patch.chunks.is_some();

    match patch.status {
        DocumentStatus::Completed => {
            if patch.content.is_none() || patch.chunks.is_none() {
                return Err(AppError::Internal(
                    "A completed document needs content and chunks".to_string(),
                ));
            }
            if patch.error.is_some() {
                return Err(AppError::Internal(
                    "A completed document cannot carry an error".to_string(),
                ));
            }
        }
        DocumentStatus::Failed => {
            if patch.error.is_none() {
                return Err(AppError::Internal("A failed document needs an error".to_string()));
            }
            if carries_result {
                return Err(AppError::Internal(
                    "A failed document cannot carry content or chunks".to_string(),
                ));
            }
        }
        _ => {
            if carries_result || patch.error.is_some() {
                return Err(AppError::Internal(format!(
                    "Status {} cannot carry content, chunks or an error",
                    patch.status
                )));
            }
        }
    }

    Ok(())
}
