use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::ProcessingJob;
use crate::types::{AppError, AppResult};

/// Slot held by the one flow working on a document.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEntry {
    /// Claimed, no parse job submitted yet (converting or submitting).
    Claimed,
    Active(ProcessingJob),
}

/// In-process registry of documents being worked on. A document has at most
/// one entry; a second claim is rejected. Only the flow that claimed a
/// document unregisters it.
#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<HashMap<Uuid, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn claim(&self, document_id: Uuid) -> AppResult<()> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&document_id) {
            return Err(AppError::Conflict(format!(
                "Document {} already has a job in progress",
                document_id
            )));
        }
        guard.insert(document_id, JobEntry::Claimed);
        Ok(())
    }

    /// Record the submitted job, replacing whatever the slot held.
    pub async fn activate(&self, job: ProcessingJob) {
        let mut guard = self.inner.write().await;
        guard.insert(job.document_id, JobEntry::Active(job));
    }

    pub async fn touch(&self, document_id: Uuid) {
        let mut guard = self.inner.write().await;
        if let Some(JobEntry::Active(job)) = guard.get_mut(&document_id) {
            job.last_polled_at = Some(Utc::now());
        }
    }

    pub async fn unregister(&self, document_id: Uuid) -> Option<JobEntry> {
        let mut guard = self.inner.write().await;
        guard.remove(&document_id)
    }

    pub async fn get(&self, document_id: Uuid) -> Option<JobEntry> {
        let guard = self.inner.read().await;
        guard.get(&document_id).cloned()
    }

    pub async fn contains(&self, document_id: Uuid) -> bool {
        self.inner.read().await.contains_key(&document_id)
    }

    pub async fn active_job(&self, document_id: Uuid) -> Option<ProcessingJob> {
        match self.get(document_id).await {
            Some(JobEntry::Active(job)) => Some(job),
            _ => None,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
