//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::engine::Backpressure;

pub use cli::{
    ArtifactOverrides, CheckEngineArgs, CliArgs, Command, EngineOverrides, ServeArgs,
    ServeOverrides, SweepArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pressroom";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_ENGINE_MAX_INSTANCES: u32 = 1;
const DEFAULT_ENGINE_MAX_CONTEXTS_PER_INSTANCE: u32 = 4;
const DEFAULT_ENGINE_LAUNCH_ATTEMPTS: u32 = 2;
const DEFAULT_ENGINE_IDLE_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_RENDER_LOAD_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_RENDER_SETTLE_MS: u64 = 500;
const DEFAULT_RENDER_CONTEXT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RENDER_MAX_HTML_BYTES: u64 = 1024 * 1024;
const DEFAULT_ARTIFACT_DIR: &str = "public/pdfs";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_SERVING_PREFIX: &str = "pdfs";
const DEFAULT_SERVING_WINDOW_SECS: u64 = 60;
const DEFAULT_ATTACHMENT_FIELD: &str = "Attachments";
const DEFAULT_RECORD_STORE_TIMEOUT_SECS: u64 = 15;
const DEFAULT_OVERALL_TIMEOUT_SECS: u64 = 45;
const DEFAULT_REAP_GRACE_SECS: u64 = 10;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub auth: AuthSettings,
    pub engine: EngineSettings,
    pub render: RenderSettings,
    pub artifacts: ArtifactSettings,
    pub record_store: RecordStoreSettings,
    pub jobs: JobsSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub api_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_instances: NonZeroU32,
    pub max_contexts_per_instance: NonZeroU32,
    pub backpressure: Backpressure,
    pub launch_attempts: NonZeroU32,
    pub chrome_path: Option<PathBuf>,
    pub sandbox: bool,
    pub extra_args: Vec<String>,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub load_timeout: Duration,
    pub settle: Duration,
    pub context_timeout: Duration,
    pub max_html_bytes: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    pub directory: PathBuf,
    pub public_base_url: Url,
    pub serving_prefix: String,
    pub serving_window: Duration,
}

#[derive(Debug, Clone)]
pub struct RecordStoreSettings {
    pub endpoint: Option<Url>,
    pub api_token: Option<String>,
    pub attachment_field: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub overall_timeout: Duration,
    pub reap_grace: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("PRESSROOM")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("engine.extra_args")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Sweep(args)) => raw.apply_artifact_overrides(&args.artifacts),
        Some(Command::CheckEngine(args)) => raw.apply_engine_overrides(&args.engine),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    auth: RawAuthSettings,
    engine: RawEngineSettings,
    render: RawRenderSettings,
    artifacts: RawArtifactSettings,
    record_store: RawRecordStoreSettings,
    jobs: RawJobsSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.artifacts_public_base_url.as_ref() {
            self.artifacts.public_base_url = Some(url.clone());
        }
        if let Some(window) = overrides.artifacts_serving_window_seconds {
            self.artifacts.serving_window_seconds = Some(window);
        }
        if let Some(endpoint) = overrides.record_store_endpoint.as_ref() {
            self.record_store.endpoint = Some(endpoint.clone());
        }
        if let Some(seconds) = overrides.jobs_overall_timeout_seconds {
            self.jobs.overall_timeout_seconds = Some(seconds);
        }

        self.apply_engine_overrides(&overrides.engine);
        self.apply_artifact_overrides(&overrides.artifacts);
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(path) = overrides.chrome_path.as_ref() {
            self.engine.chrome_path = Some(path.clone());
        }
        if let Some(value) = overrides.max_instances {
            self.engine.max_instances = Some(value);
        }
        if let Some(value) = overrides.max_contexts_per_instance {
            self.engine.max_contexts_per_instance = Some(value);
        }
        if let Some(policy) = overrides.backpressure.as_ref() {
            self.engine.backpressure = Some(policy.clone());
        }
    }

    fn apply_artifact_overrides(&mut self, overrides: &ArtifactOverrides) {
        if let Some(directory) = overrides.directory.as_ref() {
            self.artifacts.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            auth,
            engine,
            render,
            artifacts,
            record_store,
            jobs,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let auth = build_auth_settings(auth);
        let engine = build_engine_settings(engine)?;
        let render = build_render_settings(render)?;
        let artifacts = build_artifact_settings(artifacts)?;
        let record_store = build_record_store_settings(record_store)?;
        let jobs = build_jobs_settings(jobs)?;

        if record_store.timeout >= jobs.overall_timeout {
            return Err(LoadError::invalid(
                "record_store.timeout_seconds",
                "must be shorter than jobs.overall_timeout_seconds",
            ));
        }

        Ok(Self {
            server,
            logging,
            auth,
            engine,
            render,
            artifacts,
            record_store,
            jobs,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_auth_settings(auth: RawAuthSettings) -> AuthSettings {
    AuthSettings {
        api_secret: non_blank(auth.api_secret),
    }
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let max_instances = non_zero_u32(
        engine
            .max_instances
            .unwrap_or(DEFAULT_ENGINE_MAX_INSTANCES)
            .into(),
        "engine.max_instances",
    )?;
    let max_contexts_per_instance = non_zero_u32(
        engine
            .max_contexts_per_instance
            .unwrap_or(DEFAULT_ENGINE_MAX_CONTEXTS_PER_INSTANCE)
            .into(),
        "engine.max_contexts_per_instance",
    )?;
    let launch_attempts = non_zero_u32(
        engine
            .launch_attempts
            .unwrap_or(DEFAULT_ENGINE_LAUNCH_ATTEMPTS)
            .into(),
        "engine.launch_attempts",
    )?;

    let backpressure = match engine.backpressure {
        Some(value) => Backpressure::from_str(value.trim())
            .map_err(|reason| LoadError::invalid("engine.backpressure", reason))?,
        None => Backpressure::Block,
    };

    let chrome_path = engine
        .chrome_path
        .filter(|path| !path.as_os_str().is_empty());

    let idle_secs = engine
        .idle_timeout_seconds
        .unwrap_or(DEFAULT_ENGINE_IDLE_TIMEOUT_SECS);
    if idle_secs == 0 {
        return Err(LoadError::invalid(
            "engine.idle_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(EngineSettings {
        max_instances,
        max_contexts_per_instance,
        backpressure,
        launch_attempts,
        chrome_path,
        sandbox: engine.sandbox.unwrap_or(false),
        extra_args: engine
            .extra_args
            .unwrap_or_default()
            .into_iter()
            .map(|arg| arg.trim().to_string())
            .filter(|arg| !arg.is_empty())
            .collect(),
        idle_timeout: Duration::from_secs(idle_secs),
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let load_timeout = positive_millis(
        render
            .load_timeout_ms
            .unwrap_or(DEFAULT_RENDER_LOAD_TIMEOUT_MS),
        "render.load_timeout_ms",
    )?;
    let context_timeout = positive_millis(
        render
            .context_timeout_ms
            .unwrap_or(DEFAULT_RENDER_CONTEXT_TIMEOUT_MS),
        "render.context_timeout_ms",
    )?;
    let settle = Duration::from_millis(render.settle_ms.unwrap_or(DEFAULT_RENDER_SETTLE_MS));

    if settle >= context_timeout {
        return Err(LoadError::invalid(
            "render.settle_ms",
            "must be shorter than render.context_timeout_ms",
        ));
    }

    let max_html_bytes_value = render
        .max_html_bytes
        .unwrap_or(DEFAULT_RENDER_MAX_HTML_BYTES);
    let max_html_bytes = NonZeroU64::new(max_html_bytes_value)
        .ok_or_else(|| LoadError::invalid("render.max_html_bytes", "must be greater than zero"))?;
    usize::try_from(max_html_bytes_value).map_err(|_| {
        LoadError::invalid(
            "render.max_html_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(RenderSettings {
        load_timeout,
        settle,
        context_timeout,
        max_html_bytes,
    })
}

fn build_artifact_settings(artifacts: RawArtifactSettings) -> Result<ArtifactSettings, LoadError> {
    let directory = artifacts
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "artifacts.directory",
            "path must not be empty",
        ));
    }

    let base = artifacts
        .public_base_url
        .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string());
    let public_base_url = parse_http_url(&base)
        .map_err(|reason| LoadError::invalid("artifacts.public_base_url", reason))?;

    let serving_prefix = artifacts
        .serving_prefix
        .unwrap_or_else(|| DEFAULT_SERVING_PREFIX.to_string())
        .trim_matches('/')
        .to_string();
    if serving_prefix.is_empty()
        || !serving_prefix
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
    {
        return Err(LoadError::invalid(
            "artifacts.serving_prefix",
            "must be a single non-empty path segment of [A-Za-z0-9_-]",
        ));
    }

    let window_secs = artifacts
        .serving_window_seconds
        .unwrap_or(DEFAULT_SERVING_WINDOW_SECS);
    if window_secs == 0 {
        return Err(LoadError::invalid(
            "artifacts.serving_window_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ArtifactSettings {
        directory,
        public_base_url,
        serving_prefix,
        serving_window: Duration::from_secs(window_secs),
    })
}

fn build_record_store_settings(
    record_store: RawRecordStoreSettings,
) -> Result<RecordStoreSettings, LoadError> {
    let endpoint = match non_blank(record_store.endpoint) {
        Some(value) => Some(
            parse_http_url(&value)
                .map_err(|reason| LoadError::invalid("record_store.endpoint", reason))?,
        ),
        None => None,
    };

    let attachment_field = non_blank(record_store.attachment_field)
        .unwrap_or_else(|| DEFAULT_ATTACHMENT_FIELD.to_string());

    let timeout_secs = record_store
        .timeout_seconds
        .unwrap_or(DEFAULT_RECORD_STORE_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "record_store.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RecordStoreSettings {
        endpoint,
        api_token: non_blank(record_store.api_token),
        attachment_field,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    let overall_secs = jobs
        .overall_timeout_seconds
        .unwrap_or(DEFAULT_OVERALL_TIMEOUT_SECS);
    if overall_secs == 0 {
        return Err(LoadError::invalid(
            "jobs.overall_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let reap_secs = jobs.reap_grace_seconds.unwrap_or(DEFAULT_REAP_GRACE_SECS);
    if reap_secs == 0 {
        return Err(LoadError::invalid(
            "jobs.reap_grace_seconds",
            "must be greater than zero",
        ));
    }

    Ok(JobsSettings {
        overall_timeout: Duration::from_secs(overall_secs),
        reap_grace: Duration::from_secs(reap_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    api_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    max_instances: Option<u32>,
    max_contexts_per_instance: Option<u32>,
    backpressure: Option<String>,
    launch_attempts: Option<u32>,
    chrome_path: Option<PathBuf>,
    sandbox: Option<bool>,
    extra_args: Option<Vec<String>>,
    idle_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    load_timeout_ms: Option<u64>,
    settle_ms: Option<u64>,
    context_timeout_ms: Option<u64>,
    max_html_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawArtifactSettings {
    directory: Option<PathBuf>,
    public_base_url: Option<String>,
    serving_prefix: Option<String>,
    serving_window_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRecordStoreSettings {
    endpoint: Option<String>,
    api_token: Option<String>,
    attachment_field: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJobsSettings {
    overall_timeout_seconds: Option<u64>,
    reap_grace_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_http_url(value: &str) -> Result<Url, String> {
    let url = Url::parse(value.trim()).map_err(|err| format!("invalid URL `{value}`: {err}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme `{other}`")),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
