//! Turn HTML into PDF bytes inside one leased render context.

use std::time::Duration;

use metrics::histogram;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    application::{
        deadline::{Deadline, Interrupted},
        engine::{EngineError, PdfOptions, RenderContext},
        error::PipelineError,
    },
    config::RenderSettings,
};

const METRIC_RENDER_MS: &str = "pressroom_render_ms";

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Cap on waiting for the document to load. Hitting it is not an error.
    pub load_timeout: Duration,
    /// Network quiescence window after load. Zero prints as soon as the
    /// document has loaded.
    pub settle: Duration,
    /// Total budget for one context, from load to printed bytes.
    pub context_timeout: Duration,
    pub pdf: PdfOptions,
}

impl From<&RenderSettings> for RenderConfig {
    fn from(settings: &RenderSettings) -> Self {
        Self {
            load_timeout: settings.load_timeout,
            settle: settings.settle,
            context_timeout: settings.context_timeout,
            pdf: PdfOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderExecutor {
    config: RenderConfig,
}

impl RenderExecutor {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    /// Render `html` to PDF. The context is closed on every path.
    pub async fn render(
        &self,
        context: RenderContext,
        html: &str,
        deadline: &Deadline,
    ) -> Result<Vec<u8>, PipelineError> {
        let started = Instant::now();
        let instance_id = context.instance_id();
        let stage = deadline.child(self.config.context_timeout);
        let budget_ms = stage.remaining().as_millis() as u64;

        let result = self.drive(&context, html, &stage, budget_ms).await;
        context.close().await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        histogram!(
            METRIC_RENDER_MS,
            "result" => if result.is_ok() { "ok" } else { "error" }
        )
        .record(elapsed_ms as f64);

        match &result {
            Ok(bytes) => info!(
                target = "pressroom::render",
                op = "render",
                result = "ok",
                instance_id,
                size_bytes = bytes.len(),
                elapsed_ms,
                "render completed"
            ),
            Err(err) => warn!(
                target = "pressroom::render",
                op = "render",
                result = err.code(),
                instance_id,
                elapsed_ms,
                error = %err,
                "render failed"
            ),
        }

        result
    }

    async fn drive(
        &self,
        context: &RenderContext,
        html: &str,
        stage: &Deadline,
        budget_ms: u64,
    ) -> Result<Vec<u8>, PipelineError> {
        let page = context.page();

        // Load and network quiescence share one cap; whichever ends first wins.
        let load = stage.child(self.config.load_timeout);
        let settle = self.config.settle;
        let loaded = load
            .run(async {
                page.load_html(html).await?;
                if !settle.is_zero() {
                    page.wait_for_network_idle(settle).await?;
                }
                Ok::<_, EngineError>(())
            })
            .await;
        match loaded {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(PipelineError::render_failure(err.to_string())),
            Err(Interrupted::Elapsed) if !stage.is_expired() => {
                debug!(
                    target = "pressroom::render",
                    load_timeout_ms = self.config.load_timeout.as_millis() as u64,
                    "load cap reached; printing current document"
                );
            }
            Err(reason) => return Err(interrupted(reason, budget_ms)),
        }

        let bytes = stage
            .run(page.print_pdf(&self.config.pdf))
            .await
            .map_err(|reason| interrupted(reason, budget_ms))?
            .map_err(|err| PipelineError::render_failure(err.to_string()))?;

        if bytes.is_empty() {
            return Err(PipelineError::render_failure("engine produced an empty document"));
        }
        Ok(bytes)
    }
}

fn interrupted(reason: Interrupted, budget_ms: u64) -> PipelineError {
    match reason {
        Interrupted::Elapsed => PipelineError::RenderTimeout { budget_ms },
        // Cancellation comes from the job deadline or process shutdown; the
        // orchestrator decides the final classification.
        Interrupted::Cancelled => PipelineError::engine_unavailable("render cancelled"),
    }
}
