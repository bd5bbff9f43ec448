use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::dispatcher::ParsingDispatcher;
use super::registry::JobRegistry;
use crate::chunker::chunk;
use crate::models::{Document, DocumentPatch, DocumentStatus, ProcessingJob};
use crate::parsing::{JobStatusReport, ParsingService};
use crate::registrar::SourceRegistrar;
use crate::types::{AppError, AppResult};
use crate::utils::Backoff;

/// Polls a submitted job until the document reaches a terminal status.
///
/// Every poll renews the document's lease. The tracker never releases the
/// registry claim; the flow that claimed the document does.
#[derive(Clone)]
pub struct JobTracker {
    parser: Arc<dyn ParsingService>,
    registrar: SourceRegistrar,
    dispatcher: ParsingDispatcher,
    registry: JobRegistry,
    backoff: Backoff,
    poll_timeout: Duration,
    job_timeout: Duration,
    chunk_size: usize,
}

impl JobTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parser: Arc<dyn ParsingService>,
        registrar: SourceRegistrar,
        dispatcher: ParsingDispatcher,
        registry: JobRegistry,
        backoff: Backoff,
        poll_timeout: Duration,
        job_timeout: Duration,
        chunk_size: usize,
    ) -> Self {
        Self {
            parser,
            registrar,
            dispatcher,
            registry,
            backoff,
            poll_timeout,
            job_timeout,
            chunk_size,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    /// Track a freshly submitted job with the full job budget.
    pub async fn track(&self, job: ProcessingJob) -> AppResult<Document> {
        self.track_until(job, Instant::now() + self.job_timeout).await
    }

    /// Track `job` until `deadline`. A resubmitted job gets a fresh budget.
    ///
    /// Service and timeout failures are recorded on the document, which is
    /// returned in its terminal state; only store errors surface as `Err`.
    /// If the document stops recording `job`, tracking ends and the
    /// document is returned as found.
    pub async fn track_until(&self, job: ProcessingJob, deadline: Instant) -> AppResult<Document> {
        let mut job = job;
        let mut deadline = deadline;
        let mut polls: u32 = 0;

        self.registry.activate(job.clone()).await;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.expire(&job).await;
            }

            sleep(self.backoff.delay(polls).min(remaining)).await;
            polls += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.expire(&job).await;
            }

            let polled = timeout(
                self.poll_timeout.min(remaining),
                self.parser.get_job_status(&job.job_id),
            )
            .await;

            match self.registrar.heartbeat(job.document_id, &job.job_id).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        document_id = %job.document_id,
                        job_id = %job.job_id,
                        "Document moved on from this job, stopping"
                    );
                    return self.registrar.get_document(job.document_id).await;
                }
                Err(e) => warn!(job_id = %job.job_id, error = %e, "Heartbeat failed"),
            }

            let report = match polled {
                Err(_) => {
                    warn!(job_id = %job.job_id, polls, "Status poll timed out");
                    continue;
                }
                Ok(Err(e)) if e.is_transient() => {
                    warn!(job_id = %job.job_id, polls, error = %e, "Status poll failed, will retry");
                    continue;
                }
                Ok(Err(e)) => return self.fail(&job, e.to_string()).await,
                Ok(Ok(report)) => report,
            };

            self.registry.touch(job.document_id).await;

            match report {
                JobStatusReport::Pending | JobStatusReport::Processing => {
                    debug!(job_id = %job.job_id, polls, "Parse job still running");
                }
                JobStatusReport::Completed { content, .. } => {
                    return self.complete(&job, content).await;
                }
                JobStatusReport::Failed { error, retryable }
                    if retryable && self.dispatcher.has_budget_after(job.attempt) =>
                {
                    warn!(
                        document_id = %job.document_id,
                        job_id = %job.job_id,
                        attempt = job.attempt,
                        error = %error,
                        "Parse job failed, resubmitting"
                    );
                    match self.dispatcher.resubmit(&job).await {
                        Ok(next) => {
                            job = next;
                            deadline = Instant::now() + self.job_timeout;
                            polls = 0;
                        }
                        Err(e) => {
                            // the dispatcher already recorded the failure
                            debug!(document_id = %job.document_id, error = %e, "Resubmission failed");
                            return self.registrar.get_document(job.document_id).await;
                        }
                    }
                }
                JobStatusReport::Failed { error, .. } => {
                    return self.fail(&job, error).await;
                }
            }
        }
    }

    async fn complete(&self, job: &ProcessingJob, content: String) -> AppResult<Document> {
        let chunks = chunk(&content, self.chunk_size);
        let chunk_count = chunks.len();

        let doc = self
            .registrar
            .update_status(
                job.document_id,
                &[DocumentStatus::Processing],
                DocumentPatch::completed(content, chunks).expecting_job(job.job_id.clone()),
            )
            .await?;
        info!(
            document_id = %doc.id,
            job_id = %job.job_id,
            chunks = chunk_count,
            "Document parsed"
        );
        Ok(doc)
    }

    async fn expire(&self, job: &ProcessingJob) -> AppResult<Document> {
        let error = AppError::Timeout(format!(
            "parse job {} did not finish within {:?}",
            job.job_id,
            self.job_timeout
        ));
        self.fail(job, error.to_string()).await
    }

    async fn fail(&self, job: &ProcessingJob, error: String) -> AppResult<Document> {
        warn!(
            document_id = %job.document_id,
            job_id = %job.job_id,
            error = %error,
            "Parse job failed"
        );
        self.registrar
            .update_status(
                job.document_id,
                &[DocumentStatus::Processing],
                DocumentPatch::failed(error).expecting_job(job.job_id.clone()),
            )
            .await
    }
}
