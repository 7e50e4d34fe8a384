//! Time budgets shared by every stage of a render job.
//!
//! A [`Deadline`] couples an absolute expiry instant with a cancellation
//! token. Stages derive child deadlines that never outlive their parent, and
//! cancelling a parent (overall timeout, process shutdown) interrupts every
//! stage waiting on a child.

use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Upper bound applied when a budget would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Why a deadline-bounded future did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("deadline elapsed")]
    Elapsed,
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Instant,
    token: CancellationToken,
}

impl Deadline {
    /// A fresh root deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self::with_token(budget, CancellationToken::new())
    }

    /// A root deadline whose cancellation is driven by `token`.
    pub fn with_token(budget: Duration, token: CancellationToken) -> Self {
        Self {
            expires_at: expiry_after(budget),
            token,
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Derive a stage deadline bounded by both `budget` and this deadline.
    pub fn child(&self, budget: Duration) -> Self {
        Self {
            expires_at: self.expires_at.min(expiry_after(budget)),
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Drive `future` until it completes, the deadline passes or the token is cancelled.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupted::Cancelled),
            _ = sleep_until(self.expires_at) => Err(Interrupted::Elapsed),
            output = future => Ok(output),
        }
    }
}

fn expiry_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget).unwrap_or_else(|| now + FAR_FUTURE)
}
