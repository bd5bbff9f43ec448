use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DocumentStore, PatchOutcome};
use crate::models::{Document, DocumentPatch, DocumentStatus, RegisterRequest};
use crate::types::AppResult;

/// Process-local document store. A single write lock makes registration and
/// conditional patches atomic.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<RwLock<HashMap<Uuid, Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, request: &RegisterRequest) -> AppResult<(Document, bool)> {
        let mut guard = self.inner.write().await;

        if request.idempotent {
            let existing = guard
                .values()
                .filter(|d| {
                    d.client_id == request.client_id
                        && d.source_ref == request.source_ref
                        && d.status != DocumentStatus::Failed
                })
                .max_by_key(|d| d.created_at);
            if let Some(doc) = existing {
                return Ok((doc.clone(), false));
            }
        }

        let doc = Document::new(request);
        guard.insert(doc.id, doc.clone());
        Ok((doc, true))
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Document>> {
        let guard = self.inner.read().await;
        Ok(guard.get(&id).cloned())
    }

    async fn apply_patch(
        &self,
        id: Uuid,
        expected: &[DocumentStatus],
        patch: &DocumentPatch,
    ) -> AppResult<PatchOutcome> {
        let mut guard = self.inner.write().await;
        let Some(doc) = guard.get_mut(&id) else {
            return Ok(PatchOutcome::NotFound);
        };

        if !expected.contains(&doc.status) {
            return Ok(PatchOutcome::Stale {
                current: doc.status,
            });
        }
        if let Some(job) = &patch.expected_job {
            if doc.job_id.as_ref() != Some(job) {
                return Ok(PatchOutcome::JobReplaced {
                    current_job: doc.job_id.clone(),
                });
            }
        }

        doc.apply(patch);
        Ok(PatchOutcome::Applied(doc.clone()))
    }

    async fn list_for_client(&self, client_id: Uuid) -> AppResult<Vec<Document>> {
        let guard = self.inner.read().await;
        let mut docs: Vec<Document> = guard
            .values()
            .filter(|d| d.client_id == client_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }

    async fn list_stale(
        &self,
        statuses: &[DocumentStatus],
        updated_before: DateTime<Utc>,
    ) -> AppResult<Vec<Document>> {
        let guard = self.inner.read().await;
        let mut docs: Vec<Document> = guard
            .values()
            .filter(|d| statuses.contains(&d.status) && d.updated_at < updated_before)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.updated_at);
        Ok(docs)
    }

    async fn heartbeat(&self, id: Uuid, job_id: &str) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        match guard.get_mut(&id) {
            Some(doc)
                if doc.status == DocumentStatus::Processing
                    && doc.job_id.as_deref() == Some(job_id) =>
            {
                doc.heartbeat_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> AppResult<bool> {
        let mut guard = self.inner.write().await;
        Ok(guard.remove(&id).is_some())
    }

    async fn source_in_use(&self, client_id: Uuid, source_ref: &str) -> AppResult<bool> {
        let guard = self.inner.read().await;
        Ok(guard
            .values()
            .any(|d| d.client_id == client_id && d.source_ref == source_ref))
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, SourceKind};

    fn request(client_id: Uuid, source_ref: &str, idempotent: bool) -> RegisterRequest {
        RegisterRequest {
            client_id,
            source_kind: SourceKind::Url,
            source_ref: source_ref.to_string(),
            canonical_ref: None,
            mime_type: "text/html".to_string(),
            document_type: "web".to_string(),
            idempotent,
        }
    }

    #[tokio::test]
    async fn test_idempotent_insert_returns_active_document() {
        let store = MemoryDocumentStore::new();
        let client = Uuid::new_v4();

        let (first, created) = store.insert(&request(client, "https://a.com", true)).await.unwrap();
        assert!(created);
        let (second, created) = store.insert(&request(client, "https://a.com", true)).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let (other_client, created) = store
            .insert(&request(Uuid::new_v4(), "https://a.com", true))
            .await
            .unwrap();
        assert!(created);
        assert_ne!(other_client.id, first.id);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_failed_documents_do_not_block_registration() {
        let store = MemoryDocumentStore::new();
        let client = Uuid::new_v4();

        let (first, _) = store.insert(&request(client, "https://a.com", true)).await.unwrap();
        store
            .apply_patch(first.id, &[DocumentStatus::Pending], &DocumentPatch::failed("boom"))
            .await
            .unwrap();

        let (second, created) = store.insert(&request(client, "https://a.com", true)).await.unwrap();
        assert!(created);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn test_concurrent_idempotent_inserts_create_one_row() {
        let store = MemoryDocumentStore::new();
        let client = Uuid::new_v4();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert(&request(client, "https://race.example", true))
                        .await
                        .unwrap()
                        .0
                        .id
                })
            })
            .collect();

        let ids: Vec<Uuid> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_patch_requires_expected_status() {
        let store = MemoryDocumentStore::new();
        let (doc, _) = store
            .insert(&request(Uuid::new_v4(), "https://a.com", false))
            .await
            .unwrap();

        let outcome = store
            .apply_patch(
                doc.id,
                &[DocumentStatus::Processing],
                &DocumentPatch::completed("text".into(), vec![Chunk { id: 0, content: "text".into() }]),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PatchOutcome::Stale {
                current: DocumentStatus::Pending
            }
        );

        let stored = store.get(doc.id).await.unwrap().unwrap();
        assert!(stored.chunks.is_none());
        assert!(stored.content.is_none());

        let missing = store
            .apply_patch(Uuid::new_v4(), &[DocumentStatus::Pending], &DocumentPatch::failed("x"))
            .await
            .unwrap();
        assert_eq!(missing, PatchOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_patch_pinned_to_a_job_rejects_a_replaced_job() {
        let store = MemoryDocumentStore::new();
        let (doc, _) = store
            .insert(&request(Uuid::new_v4(), "https://a.com", false))
            .await
            .unwrap();
        store
            .apply_patch(doc.id, &[DocumentStatus::Pending], &DocumentPatch::processing("job-2", 1))
            .await
            .unwrap();

        let outcome = store
            .apply_patch(
                doc.id,
                &[DocumentStatus::Processing],
                &DocumentPatch::processing("job-3", 2).expecting_job("job-1"),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PatchOutcome::JobReplaced {
                current_job: Some("job-2".to_string())
            }
        );
        let stored = store.get(doc.id).await.unwrap().unwrap();
        assert_eq!(stored.job_id.as_deref(), Some("job-2"));

        let outcome = store
            .apply_patch(
                doc.id,
                &[DocumentStatus::Processing],
                &DocumentPatch::processing("job-3", 2).expecting_job("job-2"),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, PatchOutcome::Applied(d) if d.job_id.as_deref() == Some("job-3")));
    }

    #[tokio::test]
    async fn test_heartbeat_only_for_the_recorded_job() {
        let store = MemoryDocumentStore::new();
        let (doc, _) = store
            .insert(&request(Uuid::new_v4(), "https://a.com", false))
            .await
            .unwrap();
        assert!(!store.heartbeat(doc.id, "job-1").await.unwrap());

        store
            .apply_patch(doc.id, &[DocumentStatus::Pending], &DocumentPatch::processing("job-1", 0))
            .await
            .unwrap();
        assert!(store.heartbeat(doc.id, "job-1").await.unwrap());
        assert!(!store.heartbeat(doc.id, "job-0").await.unwrap());
        assert!(!store.heartbeat(Uuid::new_v4(), "job-1").await.unwrap());

        let stored = store.get(doc.id).await.unwrap().unwrap();
        assert!(stored.heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_source_in_use_is_scoped_to_the_client() {
        let store = MemoryDocumentStore::new();
        let client = Uuid::new_v4();
        let (doc, _) = store.insert(&request(client, "c/shared.pdf", false)).await.unwrap();

        assert!(store.source_in_use(client, "c/shared.pdf").await.unwrap());
        assert!(!store.source_in_use(Uuid::new_v4(), "c/shared.pdf").await.unwrap());

        store.delete(doc.id).await.unwrap();
        assert!(!store.source_in_use(client, "c/shared.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_stale_filters_by_status_and_age() {
        let store = MemoryDocumentStore::new();
        let client = Uuid::new_v4();
        let (a, _) = store.insert(&request(client, "https://a.com", false)).await.unwrap();
        let (b, _) = store.insert(&request(client, "https://b.com", false)).await.unwrap();
        store
            .apply_patch(b.id, &[DocumentStatus::Pending], &DocumentPatch::failed("x"))
            .await
            .unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let stale = store.list_stale(&DocumentStatus::ACTIVE, cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, a.id);

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(store.list_stale(&DocumentStatus::ACTIVE, past).await.unwrap().is_empty());
    }
}
