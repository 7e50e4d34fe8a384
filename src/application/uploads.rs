//! Delivery of artifact URLs to the external record store.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::histogram;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};
use url::Url;

use crate::{
    application::{deadline::Deadline, error::PipelineError},
    domain::{artifacts::Artifact, jobs::RecordId},
};

const METRIC_UPLOAD_MS: &str = "pressroom_upload_ms";

/// What the record store receives for one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub url: Url,
    pub file_name: String,
}

#[derive(Debug, Clone, Error)]
pub enum RecordStoreError {
    #[error("record store responded with status {status}")]
    Rejected { status: u16, body: String },
    #[error("record store request failed: {0}")]
    Transport(String),
}

/// External system that owns the records files are attached to.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn attach(
        &self,
        record_id: &RecordId,
        attachment: &AttachmentRef,
    ) -> Result<(), RecordStoreError>;
}

/// Result of a single attach attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Attached,
    Rejected { status: u16, detail: String },
    TimedOut { budget_ms: u64 },
    Transport { detail: String },
}

impl UploadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadOutcome::Attached => "attached",
            UploadOutcome::Rejected { .. } => "rejected",
            UploadOutcome::TimedOut { .. } => "timed_out",
            UploadOutcome::Transport { .. } => "transport",
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, UploadOutcome::Attached)
    }

    pub fn into_result(self) -> Result<(), PipelineError> {
        match self {
            UploadOutcome::Attached => Ok(()),
            UploadOutcome::Rejected { status, detail } => Err(PipelineError::upload_failure(
                format!("rejected with status {status}: {detail}"),
            )),
            UploadOutcome::TimedOut { budget_ms } => Err(PipelineError::upload_failure(format!(
                "no response within {budget_ms}ms"
            ))),
            UploadOutcome::Transport { detail } => Err(PipelineError::upload_failure(detail)),
        }
    }
}

#[derive(Clone)]
pub struct UploadCoordinator {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
}

impl UploadCoordinator {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Attach `artifact` to `record_id` within the upload sub-deadline. Never retries.
    pub async fn attach(
        &self,
        artifact: &Artifact,
        record_id: &RecordId,
        deadline: &Deadline,
    ) -> UploadOutcome {
        let stage = deadline.child(self.timeout);
        let budget_ms = stage.remaining().as_millis() as u64;
        let attachment = AttachmentRef {
            url: artifact.url.clone(),
            file_name: artifact.file_name.clone(),
        };

        let started = Instant::now();
        let outcome = match stage.run(self.store.attach(record_id, &attachment)).await {
            Ok(Ok(())) => UploadOutcome::Attached,
            Ok(Err(RecordStoreError::Rejected { status, body })) => UploadOutcome::Rejected {
                status,
                detail: truncate_detail(body),
            },
            Ok(Err(RecordStoreError::Transport(detail))) => UploadOutcome::Transport { detail },
            Err(_) => UploadOutcome::TimedOut { budget_ms },
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        histogram!(METRIC_UPLOAD_MS, "outcome" => outcome.as_str()).record(elapsed_ms as f64);

        if outcome.is_attached() {
            info!(
                target = "pressroom::upload",
                op = "attach",
                result = outcome.as_str(),
                record_id = %record_id,
                file_name = %artifact.file_name,
                elapsed_ms,
                "attachment accepted"
            );
        } else {
            warn!(
                target = "pressroom::upload",
                op = "attach",
                result = outcome.as_str(),
                record_id = %record_id,
                file_name = %artifact.file_name,
                elapsed_ms,
                outcome = ?outcome,
                "attachment not accepted"
            );
        }

        outcome
    }
}

fn truncate_detail(mut body: String) -> String {
    const MAX_DETAIL: usize = 512;
    if body.len() > MAX_DETAIL {
        let mut cut = MAX_DETAIL;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use time::OffsetDateTime;

    struct ScriptedStore {
        delay: Duration,
        result: Result<(), RecordStoreError>,
    }

    #[async_trait]
    impl RecordStore for ScriptedStore {
        async fn attach(
            &self,
            _record_id: &RecordId,
            _attachment: &AttachmentRef,
        ) -> Result<(), RecordStoreError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn artifact() -> Artifact {
        Artifact {
            file_name: "rec1-x.pdf".to_string(),
            path: PathBuf::from("/tmp/rec1-x.pdf"),
            url: Url::parse("https://files.example.com/pdfs/rec1-x.pdf").expect("url"),
            size_bytes: 10,
            checksum: "00".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            delete_after: None,
        }
    }

    fn coordinator(delay: Duration, result: Result<(), RecordStoreError>) -> UploadCoordinator {
        UploadCoordinator::new(Arc::new(ScriptedStore { delay, result }), Duration::from_secs(15))
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_update_is_attached() {
        let record = RecordId::parse("rec1").expect("record");
        let outcome = coordinator(Duration::from_millis(50), Ok(()))
            .attach(&artifact(), &record, &Deadline::after(Duration::from_secs(45)))
            .await;
        assert_eq!(outcome, UploadOutcome::Attached);
        assert!(outcome.into_result().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn non_success_status_is_rejected_not_panicking() {
        let record = RecordId::parse("rec1").expect("record");
        let outcome = coordinator(
            Duration::ZERO,
            Err(RecordStoreError::Rejected {
                status: 422,
                body: "unknown field".to_string(),
            }),
        )
        .attach(&artifact(), &record, &Deadline::after(Duration::from_secs(45)))
        .await;

        assert_eq!(
            outcome,
            UploadOutcome::Rejected {
                status: 422,
                detail: "unknown field".to_string()
            }
        );
        assert!(matches!(
            outcome.into_result(),
            Err(PipelineError::UploadFailure { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_hits_upload_sub_deadline() {
        let record = RecordId::parse("rec1").expect("record");
        let started = Instant::now();
        let outcome = coordinator(Duration::from_secs(20), Ok(()))
            .attach(&artifact(), &record, &Deadline::after(Duration::from_secs(45)))
            .await;

        assert_eq!(outcome, UploadOutcome::TimedOut { budget_ms: 15_000 });
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_deadline_never_outlives_job_deadline() {
        let record = RecordId::parse("rec1").expect("record");
        let started = Instant::now();
        let outcome = coordinator(Duration::from_secs(20), Ok(()))
            .attach(&artifact(), &record, &Deadline::after(Duration::from_secs(5)))
            .await;

        assert!(matches!(outcome, UploadOutcome::TimedOut { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    }

    #[test]
    fn long_rejection_bodies_are_truncated() {
        let body = "é".repeat(400);
        let truncated = truncate_detail(body);
        assert!(truncated.len() <= 512);
        assert!(truncated.chars().all(|ch| ch == 'é'));
    }
}
