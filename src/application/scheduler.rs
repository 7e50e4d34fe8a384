//! Deferred, cancellable one-shot tasks.
//!
//! Used for artifact expiry: a deletion is armed after a successful upload and
//! fires once the serving window closes. Pending tasks can be cancelled
//! individually or flushed (run immediately) during shutdown so no file
//! outlives the process.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone, Default)]
pub struct DeferredTasks {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    pending: DashMap<u64, PendingTask>,
    next_id: AtomicU64,
    flush: CancellationToken,
}

struct PendingTask {
    key: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct DeferredTask {
    id: u64,
    cancel: CancellationToken,
}

impl DeferredTask {
    /// Prevent the task from running if it has not fired yet.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl DeferredTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` once `delay` has elapsed, unless cancelled first.
    pub fn schedule<F>(&self, key: impl Into<String>, delay: Duration, action: F) -> DeferredTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        self.inner.pending.insert(
            id,
            PendingTask {
                key: key.clone(),
                cancel: cancel.clone(),
                handle: None,
            },
        );

        let inner = Arc::clone(&self.inner);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = task_cancel.cancelled() => {
                    debug!(
                        target = "pressroom::scheduler",
                        key = %key,
                        "deferred task cancelled"
                    );
                }
                _ = inner.flush.cancelled() => action.await,
                _ = tokio::time::sleep(delay) => action.await,
            }
            inner.pending.remove(&id);
        });

        if let Some(mut entry) = self.inner.pending.get_mut(&id) {
            entry.handle = Some(handle);
        }

        DeferredTask { id, cancel }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_pending(&self, task: &DeferredTask) -> bool {
        self.inner
            .pending
            .get(&task.id)
            .is_some_and(|entry| !entry.cancel.is_cancelled())
    }

    /// Fire every pending task now and wait for all of them to finish.
    ///
    /// Tasks scheduled after a flush run immediately.
    pub async fn flush(&self) {
        self.inner.flush.cancel();

        let ids: Vec<u64> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, task)) = self.inner.pending.remove(&id) {
                debug!(
                    target = "pressroom::scheduler",
                    key = %task.key,
                    "flushing deferred task"
                );
                if let Some(handle) = task.handle {
                    handles.push(handle);
                }
            }
        }

        let flushed = handles.len();
        for handle in handles {
            let _ = handle.await;
        }

        info!(
            target = "pressroom::scheduler",
            flushed, "deferred tasks flushed"
        );
    }
}
