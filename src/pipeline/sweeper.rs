// Recovery of documents left active by a crashed or restarted process

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::Pipeline;
use crate::models::{Document, DocumentStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepAction {
    /// Keep polling the recorded job; `elapsed` of its budget is used up.
    Resume { elapsed: Duration },
    /// Past the job timeout, fail it.
    Expire,
    /// Still leased by a live process, or too young to judge.
    Skip,
}

/// Decide what to do with an active document this process is not working
/// on. A document touched within `lease_timeout` belongs to whichever
/// process touched it.
pub fn classify(
    doc: &Document,
    now: DateTime<Utc>,
    job_timeout: Duration,
    lease_timeout: Duration,
    max_attempts: u32,
) -> SweepAction {
    let idle = (now - doc.last_activity()).to_std().unwrap_or_default();
    if idle < lease_timeout {
        return SweepAction::Skip;
    }

    let elapsed = (now - doc.updated_at).to_std().unwrap_or_default();
    if elapsed >= job_timeout {
        return SweepAction::Expire;
    }

    match doc.status {
        DocumentStatus::Processing if doc.job_id.is_some() && doc.attempt < max_attempts => {
            SweepAction::Resume { elapsed }
        }
        _ => SweepAction::Skip,
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub resumed: usize,
    pub expired: usize,
    pub skipped: usize,
}

/// Run [`Pipeline::sweep_orphans`] every `interval` until the task is aborted.
pub fn spawn_periodic(pipeline: Pipeline, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match pipeline.sweep_orphans().await {
                Ok(report) if report.resumed + report.expired > 0 => {
                    info!(
                        resumed = report.resumed,
                        expired = report.expired,
                        "Swept orphaned documents"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Orphan sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentPatch, RegisterRequest, SourceKind};
    use uuid::Uuid;

    fn doc(status: DocumentStatus, age: Duration) -> Document {
        let mut doc = Document::new(&RegisterRequest {
            client_id: Uuid::new_v4(),
            source_kind: SourceKind::Url,
            source_ref: "https://example.com/a.pdf".to_string(),
            canonical_ref: None,
            mime_type: "application/pdf".to_string(),
            document_type: "pdf".to_string(),
            idempotent: false,
        });
        if status == DocumentStatus::Processing {
            doc.apply(&DocumentPatch::processing("job-1", 0));
        } else {
            doc.status = status;
        }
        doc.updated_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
        doc
    }

    const JOB_TIMEOUT: Duration = Duration::from_secs(600);
    const LEASE: Duration = Duration::from_secs(30);

    #[test]
    fn test_classification() {
        let now = Utc::now();

        let young = doc(DocumentStatus::Processing, Duration::from_secs(60));
        assert!(matches!(
            classify(&young, now, JOB_TIMEOUT, LEASE, 3),
            SweepAction::Resume { elapsed } if elapsed >= Duration::from_secs(59)
        ));

        let old = doc(DocumentStatus::Processing, Duration::from_secs(601));
        assert_eq!(classify(&old, now, JOB_TIMEOUT, LEASE, 3), SweepAction::Expire);

        let stuck_pending = doc(DocumentStatus::Pending, Duration::from_secs(900));
        assert_eq!(
            classify(&stuck_pending, now, JOB_TIMEOUT, LEASE, 3),
            SweepAction::Expire
        );

        let fresh_pending = doc(DocumentStatus::Pending, Duration::from_secs(1));
        assert_eq!(
            classify(&fresh_pending, now, JOB_TIMEOUT, LEASE, 3),
            SweepAction::Skip
        );

        let mut spent = doc(DocumentStatus::Processing, Duration::from_secs(60));
        spent.attempt = 3;
        assert_eq!(classify(&spent, now, JOB_TIMEOUT, LEASE, 3), SweepAction::Skip);
    }

    #[test]
    fn test_heartbeating_job_is_left_to_its_owner() {
        let now = Utc::now();

        let mut polled = doc(DocumentStatus::Processing, Duration::from_secs(60));
        polled.heartbeat_at = Some(now - chrono::Duration::seconds(5));
        assert_eq!(classify(&polled, now, JOB_TIMEOUT, LEASE, 3), SweepAction::Skip);

        // heartbeats keep a long job away from expiry too
        let mut long_running = doc(DocumentStatus::Processing, Duration::from_secs(900));
        long_running.heartbeat_at = Some(now - chrono::Duration::seconds(5));
        assert_eq!(
            classify(&long_running, now, JOB_TIMEOUT, LEASE, 3),
            SweepAction::Skip
        );

        let mut abandoned = doc(DocumentStatus::Processing, Duration::from_secs(120));
        abandoned.heartbeat_at = Some(now - chrono::Duration::seconds(31));
        assert!(matches!(
            classify(&abandoned, now, JOB_TIMEOUT, LEASE, 3),
            SweepAction::Resume { .. }
        ));
    }
}
