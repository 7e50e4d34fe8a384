use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pressroom_jobs_total",
            Unit::Count,
            "Total number of render jobs by terminal outcome."
        );
        describe_histogram!(
            "pressroom_render_ms",
            Unit::Milliseconds,
            "Time spent inside a render context, load to printed bytes."
        );
        describe_histogram!(
            "pressroom_upload_ms",
            Unit::Milliseconds,
            "Record store attach latency in milliseconds."
        );
        describe_gauge!(
            "pressroom_engine_instances",
            Unit::Count,
            "Current number of running browser instances."
        );
        describe_gauge!(
            "pressroom_engine_open_contexts",
            Unit::Count,
            "Current number of leased render contexts across all instances."
        );
        describe_counter!(
            "pressroom_engine_launch_failures_total",
            Unit::Count,
            "Total number of failed browser launches."
        );
        describe_counter!(
            "pressroom_engine_exhausted_total",
            Unit::Count,
            "Total number of context requests rejected because the pool was full."
        );
        describe_counter!(
            "pressroom_artifacts_deleted_total",
            Unit::Count,
            "Total number of artifact files deleted, by reason."
        );
    });
}
