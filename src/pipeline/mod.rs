//! Document ingestion pipeline.
//!
//! A document moves `pending -> converting? -> processing -> completed |
//! failed`. One flow owns a document at a time: it claims the document in
//! the [`JobRegistry`], optionally converts a linked file to PDF, submits
//! it through the [`ParsingDispatcher`] and polls with the [`JobTracker`]
//! until a terminal status is written.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::db::DocumentStore;
use crate::fetcher::SourceFetcher;
use crate::intake::{self, converted_object_path};
use crate::models::{
    Chunk, Document, DocumentPatch, DocumentStatus, ProcessingJob, RegisterRequest, SourceKind,
};
use crate::normalizer::{normalize_async, InputFile, PDF_MIME};
use crate::parsing::ParsingService;
use crate::registrar::SourceRegistrar;
use crate::storage::StorageAdapter;
use crate::types::{AppError, AppResult};

pub mod dispatcher;
pub mod notifier;
pub mod registry;
pub mod sweeper;
pub mod tracker;

pub use dispatcher::ParsingDispatcher;
pub use notifier::StatusNotifier;
pub use registry::{JobEntry, JobRegistry};
pub use sweeper::{SweepAction, SweepReport};
pub use tracker::JobTracker;

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    registrar: SourceRegistrar,
    storage: Arc<dyn StorageAdapter>,
    fetcher: Arc<dyn SourceFetcher>,
    registry: JobRegistry,
    notifier: StatusNotifier,
    dispatcher: ParsingDispatcher,
    tracker: JobTracker,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn DocumentStore>,
        storage: Arc<dyn StorageAdapter>,
        parser: Arc<dyn ParsingService>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        let notifier = StatusNotifier::new();
        let registry = JobRegistry::new();
        let registrar = SourceRegistrar::new(store, storage.clone(), notifier.clone());

        let dispatcher = ParsingDispatcher::new(
            parser.clone(),
            registrar.clone(),
            registry.clone(),
            config.submit_backoff().with_jitter(true),
            config.max_attempts,
        );
        let tracker = JobTracker::new(
            parser,
            registrar.clone(),
            dispatcher.clone(),
            registry.clone(),
            config.poll_backoff(),
            config.poll_timeout(),
            config.job_timeout(),
            config.chunk_size,
        );

        Self {
            config: Arc::new(config),
            registrar,
            storage,
            fetcher,
            registry,
            notifier,
            dispatcher,
            tracker,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registrar(&self) -> &SourceRegistrar {
        &self.registrar
    }

    /// Validate, normalize and store an upload, then register it.
    ///
    /// Nothing is written to storage unless validation passes. Returns the
    /// document and whether it was newly created.
    pub async fn accept_upload(
        &self,
        client_id: Uuid,
        file: InputFile,
        idempotent: bool,
    ) -> AppResult<(Document, bool)> {
        let format = intake::validate_upload(&file, &self.config)?;
        let path = intake::upload_object_path(client_id, &file);

        let pdf = normalize_async(file).await?;
        let public_ref = self.storage.put(&path, pdf.bytes, PDF_MIME).await?;

        self.registrar
            .register(RegisterRequest {
                client_id,
                source_kind: SourceKind::Upload,
                source_ref: path,
                canonical_ref: Some(public_ref),
                mime_type: PDF_MIME.to_string(),
                document_type: format.document_type().to_string(),
                idempotent,
            })
            .await
    }

    /// Validate and register a URL source. With access checks on, the URL
    /// the parser will read must answer and be open to crawlers.
    pub async fn accept_url(
        &self,
        client_id: Uuid,
        url: &str,
        idempotent: bool,
    ) -> AppResult<(Document, bool)> {
        let intake = intake::classify_url(url)?;
        if self.config.check_url_access {
            let target = intake.canonical_ref.as_deref().unwrap_or(&intake.source_ref);
            self.fetcher.check_access(target).await?;
        }

        self.registrar
            .register(RegisterRequest {
                client_id,
                source_kind: SourceKind::Url,
                source_ref: intake.source_ref,
                canonical_ref: intake.canonical_ref,
                mime_type: intake.mime_type,
                document_type: intake.document_type.to_string(),
                idempotent,
            })
            .await
    }

    /// Accept an upload and process it in the background.
    pub async fn ingest_upload(
        &self,
        client_id: Uuid,
        file: InputFile,
        idempotent: bool,
    ) -> AppResult<(Document, bool)> {
        let (doc, created) = self.accept_upload(client_id, file, idempotent).await?;
        if created {
            self.spawn_run(doc.clone());
        }
        Ok((doc, created))
    }

    /// Accept a URL and process it in the background.
    pub async fn ingest_url(
        &self,
        client_id: Uuid,
        url: &str,
        idempotent: bool,
    ) -> AppResult<(Document, bool)> {
        let (doc, created) = self.accept_url(client_id, url, idempotent).await?;
        if created {
            self.spawn_run(doc.clone());
        }
        Ok((doc, created))
    }

    fn spawn_run(&self, doc: Document) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let document_id = doc.id;
            if let Err(e) = pipeline.run(doc).await {
                warn!(document_id = %document_id, error = %e, "Pipeline run ended with an error");
            }
        });
    }

    /// Drive one document to a terminal status.
    ///
    /// Failures along the way are recorded on the document, which is
    /// returned; `Err` means the flow could not start or the store failed.
    pub async fn run(&self, doc: Document) -> AppResult<Document> {
        let document_id = doc.id;
        self.registry.claim(document_id).await?;
        let result = self.drive(doc).await;
        self.registry.unregister(document_id).await;
        result
    }

    async fn drive(&self, doc: Document) -> AppResult<Document> {
        match self.start(&doc).await {
            Ok(job) => self.tracker.track(job).await,
            Err(AppError::Database(e)) => Err(AppError::Database(e)),
            // the failure is already recorded on the document
            Err(_) => self.registrar.get_document(doc.id).await,
        }
    }

    /// Convert the source if needed and submit it for parsing. The caller
    /// holds the registry claim; failures are recorded before returning.
    async fn start(&self, doc: &Document) -> AppResult<ProcessingJob> {
        let doc = if needs_conversion(doc) {
            match self.convert(doc).await {
                Ok(converted) => converted,
                Err(e) => {
                    self.record_failure(doc, &e).await?;
                    return Err(e);
                }
            }
        } else {
            doc.clone()
        };

        if doc.status == DocumentStatus::Failed {
            self.dispatcher.retry(&doc).await
        } else {
            self.dispatcher.submit(&doc).await
        }
    }

    /// Fetch a linked file, normalize it to PDF and store it. A pending
    /// document passes through `converting`; a failed one being retried
    /// keeps its status until resubmission records the new reference.
    async fn convert(&self, doc: &Document) -> AppResult<Document> {
        let doc = match doc.status {
            DocumentStatus::Pending => {
                self.registrar
                    .update_status(
                        doc.id,
                        &[DocumentStatus::Pending],
                        DocumentPatch::status(DocumentStatus::Converting),
                    )
                    .await?
            }
            _ => doc.clone(),
        };

        let fetched = self
            .fetcher
            .fetch(&doc.source_ref, self.config.max_upload_bytes)
            .await?;
        intake::validate_upload(&fetched, &self.config)?;
        let pdf = normalize_async(fetched).await?;

        let path = converted_object_path(doc.client_id, doc.id);
        let public_ref = self.storage.put(&path, pdf.bytes, PDF_MIME).await?;
        info!(document_id = %doc.id, path = %path, "Converted linked document to PDF");

        if doc.status == DocumentStatus::Converting {
            self.registrar
                .update_status(
                    doc.id,
                    &[DocumentStatus::Converting],
                    DocumentPatch::status(DocumentStatus::Converting)
                        .with_canonical_ref(public_ref)
                        .with_mime_type(PDF_MIME),
                )
                .await
        } else {
            let mut doc = doc;
            doc.canonical_ref = Some(public_ref);
            doc.mime_type = PDF_MIME.to_string();
            Ok(doc)
        }
    }

    async fn record_failure(&self, doc: &Document, error: &AppError) -> AppResult<Document> {
        warn!(document_id = %doc.id, error = %error, "Document failed before parsing");
        self.registrar
            .update_status(
                doc.id,
                &[
                    DocumentStatus::Pending,
                    DocumentStatus::Converting,
                    DocumentStatus::Failed,
                ],
                DocumentPatch::failed(error.to_string()),
            )
            .await
    }

    pub async fn get_document(&self, document_id: Uuid) -> AppResult<Document> {
        self.registrar.get_document(document_id).await
    }

    /// Current state of the document, waiting up to `wait` for it to
    /// reach a terminal status.
    pub async fn wait_for_terminal(&self, document_id: Uuid, wait: Duration) -> AppResult<Document> {
        let doc = self.registrar.get_document(document_id).await?;
        if doc.status.is_terminal() || wait.is_zero() {
            return Ok(doc);
        }

        let mut rx = self.notifier.subscribe(document_id, doc.status).await;
        // a transition may have landed before the subscription
        let doc = self.registrar.get_document(document_id).await?;
        if doc.status.is_terminal() {
            return Ok(doc);
        }

        let _ = tokio::time::timeout(wait, async {
            loop {
                let terminal = rx.borrow_and_update().is_terminal();
                if terminal {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        self.registrar.get_document(document_id).await
    }

    pub async fn list_documents(&self, client_id: Uuid) -> AppResult<Vec<Document>> {
        self.registrar.list_for_client(client_id).await
    }

    /// Chunks of a completed document.
    pub async fn chunks(&self, document_id: Uuid) -> AppResult<Vec<Chunk>> {
        let doc = self.registrar.get_document(document_id).await?;
        match doc.status {
            DocumentStatus::Completed => Ok(doc.chunks.unwrap_or_default()),
            other => Err(AppError::Conflict(format!(
                "Document {} is {}, chunks are available once completed",
                document_id, other
            ))),
        }
    }

    /// Resubmit a failed document. Submission happens before returning so
    /// its errors reach the caller; polling continues in the background.
    pub async fn retry_document(&self, document_id: Uuid) -> AppResult<Document> {
        let doc = self.registrar.get_document(document_id).await?;
        if doc.status != DocumentStatus::Failed {
            return Err(AppError::Conflict(format!(
                "Document {} is {}, only failed documents can be retried",
                document_id, doc.status
            )));
        }

        self.registry.claim(document_id).await?;
        info!(document_id = %document_id, "Retrying failed document");

        let job = match self.start(&doc).await {
            Ok(job) => job,
            Err(e) => {
                self.registry.unregister(document_id).await;
                return Err(e);
            }
        };

        let pipeline = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.tracker.track(job).await {
                warn!(document_id = %document_id, error = %e, "Retried job ended with an error");
            }
            pipeline.registry.unregister(document_id).await;
        });

        self.registrar.get_document(document_id).await
    }

    pub async fn remove_document(&self, document_id: Uuid) -> AppResult<()> {
        if self.registry.contains(document_id).await {
            return Err(AppError::Conflict(format!(
                "Document {} has a job in progress",
                document_id
            )));
        }
        self.registrar.remove(document_id).await
    }

    /// Resume or expire active documents whose lease has lapsed and that no
    /// flow in this process owns.
    pub async fn sweep_orphans(&self) -> AppResult<SweepReport> {
        let now = Utc::now();
        let candidates = self
            .registrar
            .store()
            .list_stale(&DocumentStatus::ACTIVE, now)
            .await?;

        let mut report = SweepReport::default();
        for doc in candidates {
            if self.registry.claim(doc.id).await.is_err() {
                continue;
            }

            match sweeper::classify(
                &doc,
                now,
                self.tracker.job_timeout(),
                self.config.lease_timeout(),
                self.dispatcher.max_attempts(),
            ) {
                SweepAction::Resume { elapsed } => {
                    report.resumed += 1;
                    self.spawn_resume(doc, elapsed);
                }
                SweepAction::Expire => {
                    let result = self.expire(&doc).await;
                    self.registry.unregister(doc.id).await;
                    match result {
                        Ok(_) => report.expired += 1,
                        Err(AppError::Conflict(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                SweepAction::Skip => {
                    self.registry.unregister(doc.id).await;
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    async fn expire(&self, doc: &Document) -> AppResult<Document> {
        let error = AppError::Timeout(format!(
            "document was left {} past the {:?} job timeout",
            doc.status,
            self.tracker.job_timeout()
        ));
        warn!(document_id = %doc.id, status = %doc.status, "Expiring orphaned document");
        let mut patch = DocumentPatch::failed(error.to_string());
        if let Some(job_id) = &doc.job_id {
            patch = patch.expecting_job(job_id.clone());
        }
        self.registrar.update_status(doc.id, &[doc.status], patch).await
    }

    /// Continue polling a recovered job. The registry claim is already held.
    fn spawn_resume(&self, doc: Document, elapsed: Duration) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let document_id = doc.id;
            let result = match doc.job_id.clone() {
                Some(job_id) => {
                    info!(document_id = %document_id, job_id = %job_id, "Resuming orphaned parse job");
                    let job = ProcessingJob::new(job_id, document_id, doc.attempt);
                    let budget = pipeline.tracker.job_timeout().saturating_sub(elapsed);
                    pipeline.tracker.track_until(job, Instant::now() + budget).await
                }
                None => Ok(doc),
            };
            pipeline.registry.unregister(document_id).await;
            if let Err(e) = result {
                warn!(document_id = %document_id, error = %e, "Resumed job ended with an error");
            }
        });
    }

    /// Documents currently owned by a flow in this process.
    pub async fn active_jobs(&self) -> usize {
        self.registry.len().await
    }

    pub async fn job_entry(&self, document_id: Uuid) -> Option<JobEntry> {
        self.registry.get(document_id).await
    }

    /// Store backend name and whether it answered.
    pub async fn store_health(&self) -> (&'static str, bool) {
        let store = self.registrar.store();
        (store.backend(), store.ping().await.is_ok())
    }
}

/// A URL source whose linked file has not been converted to PDF yet.
fn needs_conversion(doc: &Document) -> bool {
    doc.source_kind == SourceKind::Url
        && doc.canonical_ref.is_none()
        && intake::classify_url(&doc.source_ref)
            .map(|intake| intake.conversion.is_some())
            .unwrap_or(false)
}
