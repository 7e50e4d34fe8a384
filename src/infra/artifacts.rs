//! Filesystem-backed storage for rendered artifacts.
//!
//! Files are written to a temporary name inside the serving directory and
//! renamed into place, so a half-written PDF is never reachable through the
//! public URL. Every artifact is short-lived: it is deleted when its serving
//! window closes, or immediately when delivery fails.

use std::{
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use metrics::counter;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{fs, sync::oneshot, time::Instant};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    application::scheduler::{DeferredTask, DeferredTasks},
    config::ArtifactSettings,
    domain::artifacts::{Artifact, ArtifactNaming, artifact_file_name, is_artifact_file_name},
};

const METRIC_ARTIFACTS_DELETED: &str = "pressroom_artifacts_deleted_total";
const TEMP_PREFIX: &str = ".pressroom-";
const TEMP_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("refusing to persist an empty document")]
    EmptyPayload,
    #[error("invalid artifact name `{0}`")]
    InvalidName(String),
    #[error("failed to build public URL")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("artifact write task failed: {0}")]
    Join(String),
}

impl ArtifactError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArtifactError::Io(err) if err.kind() == ErrorKind::NotFound)
    }
}

/// Why an artifact was removed; recorded as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    Expired,
    Rollback,
    Swept,
    Abandoned,
}

impl DeletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionReason::Expired => "expired",
            DeletionReason::Rollback => "rollback",
            DeletionReason::Swept => "swept",
            DeletionReason::Abandoned => "abandoned",
        }
    }
}

/// Counts from one pass of [`ArtifactStore::sweep_stale`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
}

pub struct ArtifactStore {
    root: PathBuf,
    public_base: Url,
    serving_prefix: String,
    serving_window: Duration,
    sequence: AtomicU64,
    deletions: DeferredTasks,
    writes: TaskTracker,
}

impl ArtifactStore {
    /// The serving directory is created lazily on first write.
    pub fn new(settings: &ArtifactSettings, deletions: DeferredTasks) -> Result<Self, ArtifactError> {
        let public_base = public_base_url(&settings.public_base_url, &settings.serving_prefix)?;
        Ok(Self {
            root: settings.directory.clone(),
            public_base,
            serving_prefix: settings.serving_prefix.clone(),
            serving_window: settings.serving_window,
            sequence: AtomicU64::new(0),
            deletions,
            writes: TaskTracker::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn serving_prefix(&self) -> &str {
        &self.serving_prefix
    }

    pub fn serving_window(&self) -> Duration {
        self.serving_window
    }

    /// Public URL an artifact named `file_name` is reachable under.
    pub fn public_url(&self, file_name: &str) -> Result<Url, ArtifactError> {
        if !is_artifact_file_name(file_name) {
            return Err(ArtifactError::InvalidName(file_name.to_string()));
        }
        Ok(self.public_base.join(file_name)?)
    }

    /// Write `bytes` under a fresh unique name and make it visible atomically.
    pub async fn persist(
        &self,
        bytes: Vec<u8>,
        naming: ArtifactNaming<'_>,
    ) -> Result<Artifact, ArtifactError> {
        if bytes.is_empty() {
            return Err(ArtifactError::EmptyPayload);
        }

        let started = Instant::now();
        let created_at = OffsetDateTime::now_utc();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let file_name = artifact_file_name(naming, created_at, sequence);
        let url = self.public_url(&file_name)?;

        let size_bytes = bytes.len() as u64;
        let checksum = hex::encode(Sha256::digest(&bytes));
        let root = self.root.clone();
        let target = self.root.join(&file_name);

        // The write runs to completion even if this future is dropped. A file
        // nobody is waiting for any more is removed as soon as it lands.
        let (landed_tx, landed_rx) = oneshot::channel();
        self.writes.spawn(async move {
            let written = tokio::task::spawn_blocking(move || write_atomically(&root, target, &bytes))
                .await
                .map_err(|err| ArtifactError::Join(err.to_string()))
                .and_then(|result| result);
            if let Err(Ok(path)) = landed_tx.send(written) {
                let _ = remove_artifact(&path, DeletionReason::Abandoned).await;
            }
        });
        let path = landed_rx
            .await
            .map_err(|_| ArtifactError::Join("artifact write task vanished".to_string()))??;

        info!(
            target = "pressroom::artifacts",
            op = "persist",
            result = "ok",
            file_name = %file_name,
            size_bytes,
            checksum = %checksum,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "artifact persisted"
        );

        Ok(Artifact {
            file_name,
            path,
            url,
            size_bytes,
            checksum,
            created_at,
            delete_after: None,
        })
    }

    /// Arm deletion of `artifact` after `delay`. The returned handle can cancel it.
    pub fn schedule_deletion(&self, artifact: &mut Artifact, delay: Duration) -> DeferredTask {
        artifact.delete_after = Some(OffsetDateTime::now_utc() + delay);
        let path = artifact.path.clone();
        debug!(
            target = "pressroom::artifacts",
            op = "schedule_deletion",
            file_name = %artifact.file_name,
            delay_ms = delay.as_millis() as u64,
            "artifact deletion scheduled"
        );
        self.deletions
            .schedule(artifact.file_name.clone(), delay, async move {
                let _ = remove_artifact(&path, DeletionReason::Expired).await;
            })
    }

    /// Delete `artifact` right away. A missing file is a logged no-op.
    pub async fn delete_now(&self, artifact: &Artifact) -> Result<bool, ArtifactError> {
        remove_artifact(&artifact.path, DeletionReason::Rollback).await
    }

    /// Read a served artifact by file name.
    pub async fn read(&self, file_name: &str) -> Result<Bytes, ArtifactError> {
        let path = self.resolve(file_name)?;
        let data = fs::read(path).await?;
        Ok(Bytes::from(data))
    }

    /// Fire every pending deletion immediately, once in-flight writes land.
    pub async fn flush_deletions(&self) {
        self.wait_for_writes().await;
        self.deletions.flush().await;
    }

    /// Wait until every write started so far has landed or been cleaned up.
    pub async fn wait_for_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    pub fn pending_deletions(&self) -> usize {
        self.deletions.pending()
    }

    /// Remove artifacts and interrupted temporary files older than `max_age`.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<SweepReport, ArtifactError> {
        let mut report = SweepReport::default();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(report),
            Err(err) => return Err(err.into()),
        };

        let now = SystemTime::now();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let is_temp = name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX);
            if !is_temp && !is_artifact_file_name(name) {
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();

            if age >= max_age {
                if remove_artifact(&entry.path(), DeletionReason::Swept).await? {
                    report.removed += 1;
                }
            } else {
                report.kept += 1;
            }
        }

        info!(
            target = "pressroom::artifacts",
            op = "sweep",
            removed = report.removed,
            kept = report.kept,
            max_age_secs = max_age.as_secs(),
            "serving directory swept"
        );
        Ok(report)
    }

    fn resolve(&self, file_name: &str) -> Result<PathBuf, ArtifactError> {
        if !is_artifact_file_name(file_name) {
            return Err(ArtifactError::InvalidName(file_name.to_string()));
        }
        Ok(self.root.join(file_name))
    }
}

/// `{base}/{prefix}/` with exactly one slash between segments.
fn public_base_url(base: &Url, prefix: &str) -> Result<Url, ArtifactError> {
    let mut base = base.clone();
    base.set_query(None);
    base.set_fragment(None);
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(&format!("{}/", prefix.trim_matches('/')))?)
}

fn write_atomically(root: &Path, target: PathBuf, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
    std::fs::create_dir_all(root)?;
    let mut file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(root)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist_noclobber(&target).map_err(|err| err.error)?;
    Ok(target)
}

async fn remove_artifact(path: &Path, reason: DeletionReason) -> Result<bool, ArtifactError> {
    match fs::remove_file(path).await {
        Ok(()) => {
            counter!(METRIC_ARTIFACTS_DELETED, "reason" => reason.as_str()).increment(1);
            info!(
                target = "pressroom::artifacts",
                op = "delete",
                result = "removed",
                reason = reason.as_str(),
                path = %path.display(),
                "artifact deleted"
            );
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(
                target = "pressroom::artifacts",
                op = "delete",
                result = "missing",
                reason = reason.as_str(),
                path = %path.display(),
                "artifact already gone"
            );
            Ok(false)
        }
        Err(err) => {
            warn!(
                target = "pressroom::artifacts",
                op = "delete",
                result = "error",
                reason = reason.as_str(),
                path = %path.display(),
                error = %err,
                "failed to delete artifact"
            );
            Err(err.into())
        }
    }
}
