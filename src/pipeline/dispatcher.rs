use std::sync::Arc;

use tracing::{debug, info, warn};

use super::registry::JobRegistry;
use crate::models::{Document, DocumentPatch, DocumentStatus, ProcessingJob};
use crate::parsing::ParsingService;
use crate::registrar::SourceRegistrar;
use crate::types::{AppError, AppResult};
use crate::utils::{with_retry, Backoff};

/// Hands documents to the parsing service and records the job handle.
///
/// Callers hold the document's registry claim; the dispatcher only swaps
/// the entry to the submitted job.
#[derive(Clone)]
pub struct ParsingDispatcher {
    parser: Arc<dyn ParsingService>,
    registrar: SourceRegistrar,
    registry: JobRegistry,
    backoff: Backoff,
    max_attempts: u32,
}

impl ParsingDispatcher {
    pub fn new(
        parser: Arc<dyn ParsingService>,
        registrar: SourceRegistrar,
        registry: JobRegistry,
        backoff: Backoff,
        max_attempts: u32,
    ) -> Self {
        Self {
            parser,
            registrar,
            registry,
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a job on `attempt` may be followed by another submission.
    pub fn has_budget_after(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// First submission of a pending (or freshly converted) document.
    pub async fn submit(&self, doc: &Document) -> AppResult<ProcessingJob> {
        self.ensure_not_submitted(doc).await?;
        self.dispatch(
            doc,
            &[DocumentStatus::Pending, DocumentStatus::Converting],
            doc.attempt,
            None,
        )
        .await
    }

    /// Operator retry of a failed document, with a fresh attempt budget.
    pub async fn retry(&self, doc: &Document) -> AppResult<ProcessingJob> {
        if doc.status != DocumentStatus::Failed {
            return Err(AppError::Conflict(format!(
                "Document {} is {}, only failed documents can be retried",
                doc.id, doc.status
            )));
        }
        self.ensure_not_submitted(doc).await?;
        self.dispatch(doc, &[DocumentStatus::Failed], 0, None).await
    }

    /// Replace a job the service reported as failed with a new one. The
    /// write only lands while the document still records `job`, so two
    /// trackers of the same job cannot both resubmit.
    pub async fn resubmit(&self, job: &ProcessingJob) -> AppResult<ProcessingJob> {
        let doc = self.registrar.get_document(job.document_id).await?;
        if doc.job_id.as_deref() != Some(job.job_id.as_str()) {
            return Err(AppError::Conflict(format!(
                "Document {} no longer tracks job {}",
                job.document_id, job.job_id
            )));
        }
        self.dispatch(
            &doc,
            &[DocumentStatus::Processing],
            job.attempt + 1,
            Some(job.job_id.as_str()),
        )
        .await
    }

    async fn ensure_not_submitted(&self, doc: &Document) -> AppResult<()> {
        if let Some(active) = self.registry.active_job(doc.id).await {
            return Err(AppError::Conflict(format!(
                "Document {} already has parse job {}",
                doc.id, active.job_id
            )));
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        doc: &Document,
        expected: &[DocumentStatus],
        start_attempt: u32,
        replaces_job: Option<&str>,
    ) -> AppResult<ProcessingJob> {
        let pinned = |patch: DocumentPatch| match replaces_job {
            Some(job_id) => patch.expecting_job(job_id),
            None => patch,
        };

        if start_attempt >= self.max_attempts {
            let error = AppError::PermanentService(format!(
                "Gave up after {} attempts",
                self.max_attempts
            ));
            self.registrar
                .update_status(
                    doc.id,
                    expected,
                    pinned(DocumentPatch::failed(error.to_string()).with_attempt(start_attempt)),
                )
                .await?;
            return Err(error);
        }

        let document_ref = doc.parse_ref().to_string();
        let document_id = doc.id.to_string();

        let outcome = with_retry(&self.backoff, self.max_attempts, start_attempt, |attempt| {
            let parser = self.parser.clone();
            let document_ref = document_ref.clone();
            let document_id = document_id.clone();
            async move {
                debug!(document_id = %document_id, attempt, "Submitting parse job");
                parser.submit_job(&document_ref, &document_id).await
            }
        })
        .await;

        match outcome.result {
            Ok(job_id) => {
                let mut patch = DocumentPatch::processing(job_id.clone(), outcome.attempt);
                if let Some(canonical_ref) = &doc.canonical_ref {
                    patch = patch
                        .with_canonical_ref(canonical_ref.clone())
                        .with_mime_type(doc.mime_type.clone());
                }
                self.registrar
                    .update_status(doc.id, expected, pinned(patch))
                    .await?;

                let job = ProcessingJob::new(job_id, doc.id, outcome.attempt);
                self.registry.activate(job.clone()).await;
                info!(
                    document_id = %doc.id,
                    job_id = %job.job_id,
                    attempt = job.attempt,
                    "Parse job submitted"
                );
                Ok(job)
            }
            Err(error) => {
                warn!(
                    document_id = %doc.id,
                    attempt = outcome.attempt,
                    error = %error,
                    "Parse submission failed"
                );
                self.registrar
                    .update_status(
                        doc.id,
                        expected,
                        pinned(
                            DocumentPatch::failed(error.to_string())
                                .with_attempt(outcome.attempt),
                        ),
                    )
                    .await?;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDocumentStore;
    use crate::models::{RegisterRequest, SourceKind};
    use crate::parsing::JobStatusReport;
    use crate::pipeline::StatusNotifier;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// Parser that answers submissions from a script.
    struct ScriptedParser {
        submissions: Mutex<VecDeque<AppResult<String>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedParser {
        fn new(script: Vec<AppResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                submissions: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        async fn calls(&self) -> u32 {
            *self.calls.lock().await
        }
    }

    #[async_trait]
    impl ParsingService for ScriptedParser {
        async fn submit_job(&self, _document_ref: &str, _document_id: &str) -> AppResult<String> {
            *self.calls.lock().await += 1;
            self.submissions
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(AppError::PermanentService("script exhausted".into())))
        }

        async fn get_job_status(&self, _job_id: &str) -> AppResult<JobStatusReport> {
            Ok(JobStatusReport::Pending)
        }
    }

    async fn setup(
        script: Vec<AppResult<String>>,
    ) -> (ParsingDispatcher, Arc<ScriptedParser>, JobRegistry, Document) {
        let parser = ScriptedParser::new(script);
        let registrar = SourceRegistrar::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryStorage::default()),
            StatusNotifier::new(),
        );
        let (doc, _) = registrar
            .register(RegisterRequest {
                client_id: Uuid::new_v4(),
                source_kind: SourceKind::Url,
                source_ref: "https://example.com/a.pdf".to_string(),
                canonical_ref: None,
                mime_type: "application/pdf".to_string(),
                document_type: "pdf".to_string(),
                idempotent: false,
            })
            .await
            .unwrap();

        let registry = JobRegistry::new();
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(4));
        let dispatcher =
            ParsingDispatcher::new(parser.clone(), registrar, registry.clone(), backoff, 3);
        (dispatcher, parser, registry, doc)
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (dispatcher, parser, registry, doc) = setup(vec![
            Err(AppError::TransientService("503".into())),
            Err(AppError::TransientService("request timed out".into())),
            Ok("job-1".into()),
        ])
        .await;

        let job = dispatcher.submit(&doc).await.unwrap();
        assert_eq!(job.job_id, "job-1");
        assert_eq!(job.attempt, 2);
        assert_eq!(parser.calls().await, 3);
        assert_eq!(registry.active_job(doc.id).await, Some(job));

        let stored = dispatcher.registrar.get_document(doc.id).await.unwrap();
        assert_eq!(stored.status, DocumentStatus::Processing);
        assert_eq!(stored.job_id.as_deref(), Some("job-1"));
        assert_eq!(stored.attempt, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (dispatcher, parser, registry, doc) =
            setup(vec![Err(AppError::PermanentService("400 bad document".into()))]).await;

        assert!(dispatcher.submit(&doc).await.is_err());
        assert_eq!(parser.calls().await, 1);
        assert!(registry.is_empty().await);

        let stored = dispatcher.registrar.get_document(doc.id).await.unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert!(stored.error.unwrap().contains("400 bad document"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_fails_the_document() {
        let (dispatcher, parser, _, doc) = setup(vec![
            Err(AppError::TransientService("503".into())),
            Err(AppError::TransientService("503".into())),
            Err(AppError::TransientService("503".into())),
        ])
        .await;

        assert!(dispatcher.submit(&doc).await.is_err());
        assert_eq!(parser.calls().await, 3);
        let stored = dispatcher.registrar.get_document(doc.id).await.unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert_eq!(stored.attempt, 2);
    }

    #[tokio::test]
    async fn test_second_submission_is_rejected() {
        let (dispatcher, parser, _, doc) = setup(vec![Ok("job-1".into()), Ok("job-2".into())]).await;

        dispatcher.submit(&doc).await.unwrap();
        assert!(matches!(dispatcher.submit(&doc).await, Err(AppError::Conflict(_))));
        assert_eq!(parser.calls().await, 1);
    }

    /// Parser that, while a submission is in flight, lets another tracker
    /// replace the document's job.
    struct RacingParser {
        registrar: SourceRegistrar,
        document_id: Uuid,
    }

    #[async_trait]
    impl ParsingService for RacingParser {
        async fn submit_job(&self, _document_ref: &str, _document_id: &str) -> AppResult<String> {
            self.registrar
                .update_status(
                    self.document_id,
                    &[DocumentStatus::Processing],
                    DocumentPatch::processing("job-elsewhere", 1),
                )
                .await?;
            Ok("job-here".to_string())
        }

        async fn get_job_status(&self, _job_id: &str) -> AppResult<JobStatusReport> {
            Ok(JobStatusReport::Pending)
        }
    }

    #[tokio::test]
    async fn test_concurrent_resubmission_loses_to_the_first_writer() {
        let registrar = SourceRegistrar::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryStorage::default()),
            StatusNotifier::new(),
        );
        let (doc, _) = registrar
            .register(RegisterRequest {
                client_id: Uuid::new_v4(),
                source_kind: SourceKind::Url,
                source_ref: "https://example.com/a.pdf".to_string(),
                canonical_ref: None,
                mime_type: "application/pdf".to_string(),
                document_type: "pdf".to_string(),
                idempotent: false,
            })
            .await
            .unwrap();
        registrar
            .update_status(doc.id, &[DocumentStatus::Pending], DocumentPatch::processing("job-1", 0))
            .await
            .unwrap();

        let parser = Arc::new(RacingParser {
            registrar: registrar.clone(),
            document_id: doc.id,
        });
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(4));
        let dispatcher =
            ParsingDispatcher::new(parser, registrar.clone(), JobRegistry::new(), backoff, 3);

        let result = dispatcher
            .resubmit(&ProcessingJob::new("job-1", doc.id, 0))
            .await;
        assert!(matches!(result, Err(AppError::Conflict(_))));

        let stored = registrar.get_document(doc.id).await.unwrap();
        assert_eq!(stored.status, DocumentStatus::Processing);
        assert_eq!(stored.job_id.as_deref(), Some("job-elsewhere"));
    }

    #[tokio::test]
    async fn test_resubmit_and_retry() {
        let (dispatcher, _, registry, doc) = setup(vec![
            Ok("job-1".into()),
            Ok("job-2".into()),
            Err(AppError::PermanentService("rejected".into())),
            Ok("job-3".into()),
        ])
        .await;

        let first = dispatcher.submit(&doc).await.unwrap();
        let second = dispatcher.resubmit(&first).await.unwrap();
        assert_eq!(second.attempt, 1);
        assert_eq!(registry.active_job(doc.id).await.unwrap().job_id, "job-2");

        // the old handle is stale once replaced
        assert!(matches!(dispatcher.resubmit(&first).await, Err(AppError::Conflict(_))));

        assert!(dispatcher.resubmit(&second).await.is_err());
        registry.unregister(doc.id).await;
        let failed = dispatcher.registrar.get_document(doc.id).await.unwrap();
        assert_eq!(failed.status, DocumentStatus::Failed);

        let retried = dispatcher.retry(&failed).await.unwrap();
        assert_eq!(retried.job_id, "job-3");
        assert_eq!(retried.attempt, 0);
        let stored = dispatcher.registrar.get_document(doc.id).await.unwrap();
        assert_eq!(stored.status, DocumentStatus::Processing);
        assert!(stored.error.is_none());
    }
}
