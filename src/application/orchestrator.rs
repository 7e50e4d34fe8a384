//! Per-request job pipeline: acquire a context, render, persist, attach.
//!
//! Each job runs on its own task and races a single overall deadline. Every
//! stage works against a child of that deadline, so expiry or process
//! shutdown interrupts whichever stage is in flight. A job that does not
//! observe the interruption in time is reaped in the background.

use std::{sync::Arc, time::Duration};

use metrics::counter;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    application::{
        deadline::{Deadline, Interrupted},
        engine::{EnginePool, PoolError, PoolStats},
        error::PipelineError,
        render::RenderExecutor,
        uploads::UploadCoordinator,
    },
    config::{JobsSettings, RenderSettings},
    domain::{
        artifacts::{Artifact, ArtifactNaming},
        jobs::RenderJobInput,
        types::JobState,
    },
    infra::artifacts::ArtifactStore,
};

const METRIC_JOBS_TOTAL: &str = "pressroom_jobs_total";

/// A job as submitted by a caller, before validation.
#[derive(Debug, Clone)]
pub struct SubmitRenderJob {
    pub html: String,
    pub record_id: String,
    pub label: Option<String>,
}

/// A job whose artifact the record store accepted.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub job_id: Uuid,
    pub artifact: Artifact,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub overall_timeout: Duration,
    pub reap_grace: Duration,
    pub max_html_bytes: usize,
}

impl JobsConfig {
    pub fn from_settings(jobs: &JobsSettings, render: &RenderSettings) -> Self {
        Self {
            overall_timeout: jobs.overall_timeout,
            reap_grace: jobs.reap_grace,
            max_html_bytes: usize::try_from(render.max_html_bytes.get()).unwrap_or(usize::MAX),
        }
    }
}

#[derive(Clone)]
pub struct RenderService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    pool: EnginePool,
    executor: RenderExecutor,
    artifacts: Arc<ArtifactStore>,
    uploads: UploadCoordinator,
    config: JobsConfig,
    shutdown: CancellationToken,
}

/// Tracks the lifecycle of one job and logs every transition.
struct JobTrace {
    id: Uuid,
    state: JobState,
    started: Instant,
}

impl JobTrace {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            state: JobState::Received,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal job transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        debug!(
            target = "pressroom::jobs",
            job_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "job state changed"
        );
        self.state = next;
    }
}

impl RenderService {
    pub fn new(
        pool: EnginePool,
        executor: RenderExecutor,
        artifacts: Arc<ArtifactStore>,
        uploads: UploadCoordinator,
        config: JobsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                pool,
                executor,
                artifacts,
                uploads,
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.inner.artifacts
    }

    pub fn config(&self) -> &JobsConfig {
        &self.inner.config
    }

    /// Run one job to a terminal state.
    ///
    /// Returns only after the record store accepted the artifact or the job
    /// failed. Input errors are reported before any shared resource is used.
    pub async fn submit(&self, request: SubmitRenderJob) -> Result<CompletedJob, PipelineError> {
        let job_id = Uuid::new_v4();
        let started = Instant::now();

        let input = match RenderJobInput::new(
            request.html,
            &request.record_id,
            request.label.as_deref(),
            self.inner.config.max_html_bytes,
        ) {
            Ok(input) => input,
            Err(err) => {
                let err = PipelineError::InvalidInput(err);
                record_outcome(job_id, started, Err(&err));
                return Err(err);
            }
        };

        let result = if self.inner.shutdown.is_cancelled() {
            Err(PipelineError::engine_unavailable("service is shutting down"))
        } else {
            self.run_with_deadline(job_id, input).await
        };

        record_outcome(job_id, started, result.as_ref().map(|_| ()));
        result.map(|artifact| CompletedJob { job_id, artifact })
    }

    /// Stop accepting work, interrupt in-flight jobs, drain the pool and fire
    /// pending deletions.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        self.inner.pool.shutdown(grace).await;
        self.inner.artifacts.flush_deletions().await;
    }

    async fn run_with_deadline(
        &self,
        job_id: Uuid,
        input: RenderJobInput,
    ) -> Result<Artifact, PipelineError> {
        let overall = self.inner.config.overall_timeout;
        let deadline = Deadline::with_token(overall, self.inner.shutdown.child_token());
        let budget_ms = overall.as_millis() as u64;

        info!(
            target = "pressroom::jobs",
            op = "submit",
            job_id = %job_id,
            record_id = %input.record_id,
            label = input.label.as_ref().map(|label| label.as_str()).unwrap_or(""),
            html_bytes = input.html.len(),
            budget_ms,
            "job received"
        );

        let inner = Arc::clone(&self.inner);
        let task_deadline = deadline.clone();
        let mut handle =
            tokio::spawn(async move { inner.run_job(job_id, input, &task_deadline).await });

        let joined = tokio::select! {
            biased;
            joined = &mut handle => Some(joined),
            _ = tokio::time::sleep_until(deadline.expires_at()) => None,
        };

        match joined {
            Some(Ok(Err(_))) if deadline.is_expired() => {
                Err(PipelineError::OverallTimeout { budget_ms })
            }
            Some(Ok(result)) => result,
            Some(Err(err)) => Err(PipelineError::render_failure(format!(
                "job task failed: {err}"
            ))),
            None => {
                deadline.cancel();
                self.reap(job_id, handle);
                Err(PipelineError::OverallTimeout { budget_ms })
            }
        }
    }

    /// Give a timed-out job a bounded window to finish its own cleanup.
    fn reap(&self, job_id: Uuid, mut handle: JoinHandle<Result<Artifact, PipelineError>>) {
        let grace = self.inner.config.reap_grace;
        tokio::spawn(async move {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(_) => debug!(
                    target = "pressroom::jobs",
                    op = "reap",
                    job_id = %job_id,
                    "timed-out job finished cleanup"
                ),
                Err(_) => {
                    handle.abort();
                    warn!(
                        target = "pressroom::jobs",
                        op = "reap",
                        job_id = %job_id,
                        grace_ms = grace.as_millis() as u64,
                        "timed-out job aborted"
                    );
                }
            }
        });
    }
}

impl ServiceInner {
    async fn run_job(
        &self,
        job_id: Uuid,
        input: RenderJobInput,
        deadline: &Deadline,
    ) -> Result<Artifact, PipelineError> {
        let mut trace = JobTrace::new(job_id);
        let result = self.drive(&mut trace, &input, deadline).await;
        if result.is_err() {
            trace.advance(JobState::Failed);
        }
        result
    }

    async fn drive(
        &self,
        trace: &mut JobTrace,
        input: &RenderJobInput,
        deadline: &Deadline,
    ) -> Result<Artifact, PipelineError> {
        trace.advance(JobState::Rendering);
        let context = self.pool.acquire(deadline).await.map_err(pool_error)?;
        debug!(
            target = "pressroom::jobs",
            job_id = %trace.id,
            instance_id = context.instance_id(),
            "render context acquired"
        );
        let bytes = self.executor.render(context, &input.html, deadline).await?;

        // The write is not interrupted part-way; a finished file is either
        // handed on below or rolled back.
        let naming = ArtifactNaming {
            record_id: &input.record_id,
            label: input.label.as_ref(),
        };
        let mut artifact = self
            .artifacts
            .persist(bytes, naming)
            .await
            .map_err(|err| PipelineError::persist_failure(err.to_string()))?;
        trace.advance(JobState::Persisted);

        if deadline.is_expired() || deadline.is_cancelled() {
            self.rollback(trace, &artifact).await;
            let reason = if deadline.is_expired() {
                Interrupted::Elapsed
            } else {
                Interrupted::Cancelled
            };
            return Err(pool_error(PoolError::Interrupted(reason)));
        }

        trace.advance(JobState::Uploading);
        let outcome = self
            .uploads
            .attach(&artifact, &input.record_id, deadline)
            .await;

        trace.advance(JobState::Cleanup);
        if let Err(err) = outcome.into_result() {
            self.rollback(trace, &artifact).await;
            return Err(err);
        }

        self.artifacts
            .schedule_deletion(&mut artifact, self.artifacts.serving_window());
        trace.advance(JobState::Completed);
        Ok(artifact)
    }

    async fn rollback(&self, trace: &JobTrace, artifact: &Artifact) {
        if let Err(err) = self.artifacts.delete_now(artifact).await {
            warn!(
                target = "pressroom::jobs",
                op = "rollback",
                job_id = %trace.id,
                file_name = %artifact.file_name,
                error = %err,
                "failed to delete undelivered artifact"
            );
        }
    }
}

fn pool_error(err: PoolError) -> PipelineError {
    match err {
        PoolError::Exhausted { capacity } => PipelineError::PoolExhausted { capacity },
        PoolError::Unavailable(source) => PipelineError::engine_unavailable(source.to_string()),
        PoolError::ShuttingDown | PoolError::Interrupted(Interrupted::Cancelled) => {
            PipelineError::engine_unavailable("engine pool is shutting down")
        }
        // The caller reclassifies against the overall deadline.
        PoolError::Interrupted(Interrupted::Elapsed) => PipelineError::OverallTimeout {
            budget_ms: 0,
        },
    }
}

fn record_outcome(job_id: Uuid, started: Instant, outcome: Result<(), &PipelineError>) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(()) => {
            counter!(METRIC_JOBS_TOTAL, "outcome" => "completed").increment(1);
            info!(
                target = "pressroom::jobs",
                op = "complete",
                result = "completed",
                job_id = %job_id,
                elapsed_ms,
                "job completed"
            );
        }
        Err(err) => {
            counter!(METRIC_JOBS_TOTAL, "outcome" => err.code()).increment(1);
            warn!(
                target = "pressroom::jobs",
                op = "complete",
                result = err.code(),
                job_id = %job_id,
                elapsed_ms,
                error = %err,
                "job failed"
            );
        }
    }
}
