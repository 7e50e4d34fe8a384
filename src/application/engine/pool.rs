//! Bounded sharing of engine processes across concurrent jobs.
//!
//! Two pieces of shared state live here: a semaphore holding one permit per
//! context slot (`max_instances * max_contexts_per_instance`) and the set of
//! live instances with their open-context counts. Every hand-out takes a
//! permit first, then reserves a slot on an instance under the state lock.
//! The lock is never held across an await point.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::deadline::{Deadline, Interrupted};

use super::{Backpressure, Engine, EngineError, EngineLauncher, EnginePage, PoolConfig};

const METRIC_POOL_INSTANCES: &str = "pressroom_engine_instances";
const METRIC_POOL_OPEN_CONTEXTS: &str = "pressroom_engine_open_contexts";
const METRIC_POOL_LAUNCH_FAILURES: &str = "pressroom_engine_launch_failures_total";
const METRIC_POOL_EXHAUSTED: &str = "pressroom_engine_exhausted_total";

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("all {capacity} render contexts are in use")]
    Exhausted { capacity: u32 },
    #[error("no engine instance could be started")]
    Unavailable(#[source] EngineError),
    #[error("engine pool is shutting down")]
    ShuttingDown,
    #[error("context acquisition interrupted")]
    Interrupted(#[from] Interrupted),
}

/// Point-in-time occupancy of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub instances: usize,
    pub healthy_instances: usize,
    pub open_contexts: usize,
    pub capacity: usize,
    pub shutting_down: bool,
}

#[derive(Clone)]
pub struct EnginePool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    config: PoolConfig,
    launcher: Arc<dyn EngineLauncher>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    changed: Notify,
    next_instance_id: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    instances: Vec<InstanceSlot>,
    launching: u32,
}

struct InstanceSlot {
    id: u64,
    engine: Arc<dyn Engine>,
    open_contexts: u32,
    healthy: bool,
}

enum Reservation {
    Existing { id: u64, engine: Arc<dyn Engine> },
    Launch,
    Wait,
}

enum OpenFailure {
    Engine(EngineError),
    Interrupted(Interrupted),
}

impl EnginePool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        let capacity = config.capacity();
        Self {
            shared: Arc::new(PoolShared {
                config,
                launcher,
                permits: Arc::new(Semaphore::new(capacity as usize)),
                state: Mutex::new(PoolState::default()),
                changed: Notify::new(),
                next_instance_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Hand out an isolated render context, starting an engine instance if needed.
    ///
    /// Under [`Backpressure::Block`] the call waits for a free slot until
    /// `deadline` expires; under [`Backpressure::FailFast`] it fails with
    /// [`PoolError::Exhausted`] as soon as every slot is taken.
    pub async fn acquire(&self, deadline: &Deadline) -> Result<RenderContext, PoolError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let permit = self.acquire_permit(deadline).await?;
        let attempts = self.shared.config.launch_attempts.max(1);
        let mut launch_failures = 0;

        loop {
            if self.shared.shutdown.is_cancelled() {
                return Err(PoolError::ShuttingDown);
            }

            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let failure = match self.reserve() {
                Reservation::Existing { id, engine } => {
                    match self.open_on(id, engine.as_ref(), deadline).await {
                        Ok(page) => return Ok(RenderContext::new(self.clone(), id, page, permit)),
                        Err(OpenFailure::Interrupted(reason)) => return Err(reason.into()),
                        // Dead instances are retired and never count as launch failures.
                        Err(OpenFailure::Engine(_)) => continue,
                    }
                }
                Reservation::Launch => match self.launch(deadline).await {
                    Ok((id, engine)) => match self.open_on(id, engine.as_ref(), deadline).await {
                        Ok(page) => return Ok(RenderContext::new(self.clone(), id, page, permit)),
                        Err(OpenFailure::Interrupted(reason)) => return Err(reason.into()),
                        Err(OpenFailure::Engine(err)) => err,
                    },
                    Err(OpenFailure::Interrupted(reason)) => return Err(reason.into()),
                    Err(OpenFailure::Engine(err)) => err,
                },
                Reservation::Wait => {
                    debug!(
                        target = "pressroom::engine::pool",
                        "waiting for an in-flight engine launch"
                    );
                    deadline.run(changed).await?;
                    continue;
                }
            };

            launch_failures += 1;
            counter!(METRIC_POOL_LAUNCH_FAILURES).increment(1);
            warn!(
                target = "pressroom::engine::pool",
                attempt = launch_failures,
                attempts,
                error = %failure,
                "engine instance failed to start"
            );
            if launch_failures >= attempts {
                return Err(PoolError::Unavailable(failure));
            }
        }
    }

    /// Return a context obtained from [`EnginePool::acquire`].
    pub async fn release_context(&self, context: RenderContext) {
        context.close().await;
    }

    /// Stop handing out contexts, wait up to `grace` for open ones, then stop every engine.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();

        let capacity = self.shared.config.capacity();
        let in_flight = (capacity as usize).saturating_sub(self.shared.permits.available_permits());
        info!(
            target = "pressroom::engine::pool",
            in_flight,
            grace_ms = grace.as_millis() as u64,
            "draining engine pool"
        );

        match tokio::time::timeout(grace, self.shared.permits.acquire_many(capacity)).await {
            Ok(_) => {}
            Err(_) => warn!(
                target = "pressroom::engine::pool",
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed with contexts still open"
            ),
        }
        self.shared.permits.close();

        let engines: Vec<Arc<dyn Engine>> = {
            let mut state = self.lock_state();
            let engines = state.instances.drain(..).map(|slot| slot.engine).collect();
            publish_gauges(&state);
            engines
        };
        self.shared.changed.notify_waiters();

        for engine in &engines {
            engine.shutdown().await;
        }

        info!(
            target = "pressroom::engine::pool",
            instances = engines.len(),
            "engine pool shut down"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            instances: state.instances.len(),
            healthy_instances: state.instances.iter().filter(|slot| slot.healthy).count(),
            open_contexts: state
                .instances
                .iter()
                .map(|slot| slot.open_contexts as usize)
                .sum(),
            capacity: self.shared.config.capacity() as usize,
            shutting_down: self.shared.shutdown.is_cancelled(),
        }
    }

    async fn acquire_permit(&self, deadline: &Deadline) -> Result<OwnedSemaphorePermit, PoolError> {
        let permits = Arc::clone(&self.shared.permits);
        match self.shared.config.backpressure {
            Backpressure::FailFast => match permits.try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => {
                    counter!(METRIC_POOL_EXHAUSTED).increment(1);
                    Err(PoolError::Exhausted {
                        capacity: self.shared.config.capacity(),
                    })
                }
                Err(TryAcquireError::Closed) => Err(PoolError::ShuttingDown),
            },
            Backpressure::Block => {
                if permits.available_permits() == 0 {
                    counter!(METRIC_POOL_EXHAUSTED).increment(1);
                    debug!(
                        target = "pressroom::engine::pool",
                        "all render contexts busy; queueing"
                    );
                }
                tokio::select! {
                    _ = self.shared.shutdown.cancelled() => Err(PoolError::ShuttingDown),
                    acquired = deadline.run(permits.acquire_owned()) => match acquired {
                        Ok(Ok(permit)) => Ok(permit),
                        Ok(Err(_)) => Err(PoolError::ShuttingDown),
                        Err(reason) => Err(PoolError::Interrupted(reason)),
                    },
                }
            }
        }
    }

    fn reserve(&self) -> Reservation {
        let mut state = self.lock_state();
        let per_instance = self.shared.config.max_contexts_per_instance;

        let available = state
            .instances
            .iter_mut()
            .find(|slot| slot.healthy && slot.open_contexts < per_instance)
            .map(|slot| {
                slot.open_contexts += 1;
                (slot.id, Arc::clone(&slot.engine))
            });
        if let Some((id, engine)) = available {
            publish_gauges(&state);
            return Reservation::Existing { id, engine };
        }

        let healthy = state.instances.iter().filter(|slot| slot.healthy).count() as u32;
        if healthy + state.launching < self.shared.config.max_instances {
            state.launching += 1;
            return Reservation::Launch;
        }

        Reservation::Wait
    }

    async fn launch(&self, deadline: &Deadline) -> Result<(u64, Arc<dyn Engine>), OpenFailure> {
        let started = Instant::now();
        let outcome = deadline.run(self.shared.launcher.launch()).await;

        let mut state = self.lock_state();
        state.launching = state.launching.saturating_sub(1);
        let result = match outcome {
            Ok(Ok(engine)) => {
                let id = self.shared.next_instance_id.fetch_add(1, Ordering::Relaxed);
                state.instances.push(InstanceSlot {
                    id,
                    engine: Arc::clone(&engine),
                    open_contexts: 1,
                    healthy: true,
                });
                publish_gauges(&state);
                info!(
                    target = "pressroom::engine::pool",
                    instance_id = id,
                    instances = state.instances.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "engine instance started"
                );
                Ok((id, engine))
            }
            Ok(Err(err)) => Err(OpenFailure::Engine(err)),
            Err(reason) => Err(OpenFailure::Interrupted(reason)),
        };
        drop(state);

        self.shared.changed.notify_waiters();
        result
    }

    /// Health-check `engine` and open a page on the slot already reserved for `id`.
    async fn open_on(
        &self,
        id: u64,
        engine: &dyn Engine,
        deadline: &Deadline,
    ) -> Result<Arc<dyn EnginePage>, OpenFailure> {
        let alive = match deadline.run(engine.is_alive()).await {
            Ok(alive) => alive,
            Err(reason) => {
                self.release_slot(id, false).await;
                return Err(OpenFailure::Interrupted(reason));
            }
        };

        if !alive {
            warn!(
                target = "pressroom::engine::pool",
                instance_id = id,
                "engine instance failed health check; retiring"
            );
            self.release_slot(id, true).await;
            return Err(OpenFailure::Engine(EngineError::unavailable(
                "health check failed",
            )));
        }

        match deadline.run(engine.open_page()).await {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(err)) => {
                warn!(
                    target = "pressroom::engine::pool",
                    instance_id = id,
                    error = %err,
                    "failed to open page; retiring engine instance"
                );
                self.release_slot(id, true).await;
                Err(OpenFailure::Engine(err))
            }
            Err(reason) => {
                self.release_slot(id, false).await;
                Err(OpenFailure::Interrupted(reason))
            }
        }
    }

    /// Give back one context slot on `id`, optionally marking the instance dead.
    ///
    /// A dead instance is only torn down once its last open context is gone.
    async fn release_slot(&self, id: u64, retire: bool) {
        if let Some(engine) = self.release_slot_now(id, retire) {
            engine.shutdown().await;
        }
    }

    fn release_slot_now(&self, id: u64, retire: bool) -> Option<Arc<dyn Engine>> {
        let mut state = self.lock_state();
        let index = state.instances.iter().position(|slot| slot.id == id)?;

        let slot = &mut state.instances[index];
        slot.open_contexts = slot.open_contexts.saturating_sub(1);
        if retire {
            slot.healthy = false;
        }
        let evicted = if !slot.healthy && slot.open_contexts == 0 {
            info!(
                target = "pressroom::engine::pool",
                instance_id = id,
                "removing dead engine instance"
            );
            Some(state.instances.remove(index).engine)
        } else {
            None
        };

        publish_gauges(&state);
        drop(state);
        self.shared.changed.notify_waiters();
        evicted
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn publish_gauges(state: &PoolState) {
    gauge!(METRIC_POOL_INSTANCES).set(state.instances.len() as f64);
    gauge!(METRIC_POOL_OPEN_CONTEXTS).set(
        state
            .instances
            .iter()
            .map(|slot| f64::from(slot.open_contexts))
            .sum::<f64>(),
    );
}

/// An isolated page leased from the pool for a single job.
///
/// Call [`RenderContext::close`] when done. A context dropped without being
/// closed is released on a background task.
pub struct RenderContext {
    pool: EnginePool,
    instance_id: u64,
    page: Arc<dyn EnginePage>,
    permit: Option<OwnedSemaphorePermit>,
    opened_at: Instant,
}

impl RenderContext {
    fn new(
        pool: EnginePool,
        instance_id: u64,
        page: Arc<dyn EnginePage>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        debug!(
            target = "pressroom::engine::pool",
            instance_id, "render context opened"
        );
        Self {
            pool,
            instance_id,
            page,
            permit: Some(permit),
            opened_at: Instant::now(),
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn page(&self) -> &dyn EnginePage {
        self.page.as_ref()
    }

    /// Close the page and return the slot to the pool.
    pub async fn close(mut self) {
        if let Some(permit) = self.permit.take() {
            self.page.close().await;
            self.pool.release_slot(self.instance_id, false).await;
            drop(permit);
            debug!(
                target = "pressroom::engine::pool",
                instance_id = self.instance_id,
                held_ms = self.opened_at.elapsed().as_millis() as u64,
                "render context closed"
            );
        }
    }
}

impl fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("instance_id", &self.instance_id)
            .field("open", &self.permit.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };

        warn!(
            target = "pressroom::engine::pool",
            instance_id = self.instance_id,
            "render context dropped without close; releasing"
        );

        let pool = self.pool.clone();
        let page = Arc::clone(&self.page);
        let instance_id = self.instance_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    page.close().await;
                    pool.release_slot(instance_id, false).await;
                    drop(permit);
                });
            }
            Err(_) => {
                drop(pool.release_slot_now(instance_id, false));
                drop(permit);
            }
        }
    }
}
