//! Rendering engine abstraction and the pool that shares engine processes.
//!
//! An engine is a long-lived headless browser process; a page is an isolated
//! tab opened inside it for exactly one job. The traits below are the seam
//! between the pool and the concrete Chromium driver in `infra::chrome`.

mod pool;

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::config::EngineSettings;

pub use pool::{EnginePool, PoolError, PoolStats, RenderContext};

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine failed to start: {0}")]
    Launch(String),
    #[error("engine is not responding: {0}")]
    Unavailable(String),
    #[error("engine operation failed: {0}")]
    Operation(String),
}

impl EngineError {
    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation(message.into())
    }
}

/// Starts engine processes on behalf of the pool.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Engine>, EngineError>;
}

/// One running engine process.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Cheap liveness probe run before every context hand-out.
    async fn is_alive(&self) -> bool;

    /// Open a fresh isolated page. Pages are never reused.
    async fn open_page(&self) -> Result<Arc<dyn EnginePage>, EngineError>;

    /// Terminate the process. Must be idempotent.
    async fn shutdown(&self);
}

/// An isolated page inside an engine.
#[async_trait]
pub trait EnginePage: Send + Sync {
    /// Load `html` and wait for the document to finish loading.
    async fn load_html(&self, html: &str) -> Result<(), EngineError>;

    /// Resolve once no network request has been in flight for `quiet`.
    ///
    /// Callers bound this with their own deadline; a page that never goes
    /// quiet keeps this pending.
    async fn wait_for_network_idle(&self, quiet: Duration) -> Result<(), EngineError>;

    async fn print_pdf(&self, options: &PdfOptions) -> Result<Vec<u8>, EngineError>;

    /// Close the page. Must be idempotent and must not fail.
    async fn close(&self);
}

/// Page layout for printed documents. Dimensions are in inches.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfOptions {
    pub paper_width: f64,
    pub paper_height: f64,
    pub margin: f64,
    pub print_background: bool,
}

impl Default for PdfOptions {
    /// A4 portrait with 1cm margins and backgrounds enabled.
    fn default() -> Self {
        Self {
            paper_width: 8.27,
            paper_height: 11.69,
            margin: 0.3937,
            print_background: true,
        }
    }
}

/// What `acquire` does when every context slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Wait for a free slot, bounded by the caller's deadline.
    Block,
    /// Reject immediately with [`PoolError::Exhausted`].
    FailFast,
}

impl Backpressure {
    pub fn as_str(self) -> &'static str {
        match self {
            Backpressure::Block => "block",
            Backpressure::FailFast => "fail_fast",
        }
    }
}

impl fmt::Display for Backpressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backpressure {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "block" | "queue" => Ok(Backpressure::Block),
            "fail_fast" | "reject" => Ok(Backpressure::FailFast),
            other => Err(format!(
                "unknown backpressure policy `{other}` (expected `block` or `fail_fast`)"
            )),
        }
    }
}

/// Capacity and policy knobs for [`EnginePool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_instances: u32,
    pub max_contexts_per_instance: u32,
    pub backpressure: Backpressure,
    pub launch_attempts: u32,
}

impl PoolConfig {
    /// Total number of contexts that may be open at once.
    pub fn capacity(&self) -> u32 {
        self.max_instances
            .saturating_mul(self.max_contexts_per_instance)
            .clamp(1, u32::MAX >> 3)
    }
}

impl From<&EngineSettings> for PoolConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            max_instances: settings.max_instances.get(),
            max_contexts_per_instance: settings.max_contexts_per_instance.get(),
            backpressure: settings.backpressure,
            launch_attempts: settings.launch_attempts.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_parses_known_policies() {
        assert_eq!("block".parse::<Backpressure>(), Ok(Backpressure::Block));
        assert_eq!("FAIL-FAST".parse::<Backpressure>(), Ok(Backpressure::FailFast));
        assert_eq!("fail_fast".parse::<Backpressure>(), Ok(Backpressure::FailFast));
        assert!("drop".parse::<Backpressure>().is_err());
    }

    #[test]
    fn capacity_is_instances_times_contexts() {
        let config = PoolConfig {
            max_instances: 2,
            max_contexts_per_instance: 3,
            backpressure: Backpressure::Block,
            launch_attempts: 1,
        };
        assert_eq!(config.capacity(), 6);
    }
}
