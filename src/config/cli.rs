use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the Pressroom binary.
#[derive(Debug, Parser)]
#[command(name = "pressroom", version, about = "HTML to PDF render service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PRESSROOM_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Delete stale artifacts from the serving directory and exit.
    Sweep(SweepArgs),
    /// Launch one engine, render a probe document and exit.
    #[command(name = "check-engine")]
    CheckEngine(CheckEngineArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Override the Chromium executable used by the engine pool.
    #[arg(long = "engine-chrome-path", value_name = "PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Override the maximum number of engine instances.
    #[arg(long = "engine-max-instances", value_name = "COUNT")]
    pub max_instances: Option<u32>,

    /// Override the maximum number of concurrent contexts per engine instance.
    #[arg(long = "engine-max-contexts-per-instance", value_name = "COUNT")]
    pub max_contexts_per_instance: Option<u32>,

    /// Override the backpressure policy (block|fail_fast).
    #[arg(long = "engine-backpressure", value_name = "POLICY")]
    pub backpressure: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ArtifactOverrides {
    /// Override the artifact serving directory.
    #[arg(long = "artifacts-directory", value_name = "PATH")]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub engine: EngineOverrides,

    #[command(flatten)]
    pub artifacts: ArtifactOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the externally reachable base URL for artifacts.
    #[arg(long = "artifacts-public-base-url", value_name = "URL")]
    pub artifacts_public_base_url: Option<String>,

    /// Override how long artifacts stay reachable after a successful upload.
    #[arg(long = "artifacts-serving-window-seconds", value_name = "SECONDS")]
    pub artifacts_serving_window_seconds: Option<u64>,

    /// Override the record store collection endpoint.
    #[arg(long = "record-store-endpoint", value_name = "URL")]
    pub record_store_endpoint: Option<String>,

    /// Override the overall per-job deadline.
    #[arg(long = "jobs-overall-timeout-seconds", value_name = "SECONDS")]
    pub jobs_overall_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SweepArgs {
    #[command(flatten)]
    pub artifacts: ArtifactOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckEngineArgs {
    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Write the probe PDF to this path instead of discarding it.
    #[arg(long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,
}
