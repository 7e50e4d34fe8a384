use std::{process, sync::Arc, time::Duration};

use pressroom::{
    application::{
        deadline::Deadline,
        engine::{EnginePool, PoolConfig},
        error::AppError,
        orchestrator::{JobsConfig, RenderService},
        render::{RenderConfig, RenderExecutor},
        scheduler::DeferredTasks,
        uploads::UploadCoordinator,
    },
    config,
    infra::{
        artifacts::ArtifactStore,
        chrome::ChromeLauncher,
        error::InfraError,
        http::{self, ApiState, HttpState, RouterState},
        record_store::HttpRecordStore,
        telemetry,
    },
};
use tokio::signal;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const PROBE_HTML: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>probe</title></head><body><h1>pressroom engine probe</h1></body></html>";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Sweep(_) => run_sweep(settings).await,
        config::Command::CheckEngine(args) => run_check_engine(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let api_secret = settings
        .auth
        .api_secret
        .clone()
        .ok_or_else(|| InfraError::configuration("auth.api_secret is required to serve"))?;
    let record_store = HttpRecordStore::new(&settings.record_store)?;

    let artifacts = Arc::new(build_artifact_store(&settings)?);
    // Anything left over from a previous process is past its serving window.
    if let Err(err) = artifacts.sweep_stale(settings.artifacts.serving_window).await {
        warn!(
            target = "pressroom::startup",
            error = %err,
            "startup sweep of the serving directory failed"
        );
    }

    let pool = EnginePool::new(
        PoolConfig::from(&settings.engine),
        Arc::new(ChromeLauncher::new(&settings.engine)),
    );
    let executor = RenderExecutor::new(RenderConfig::from(&settings.render));
    let uploads = UploadCoordinator::new(Arc::new(record_store), settings.record_store.timeout);
    let jobs = JobsConfig::from_settings(&settings.jobs, &settings.render);
    let max_html_bytes = jobs.max_html_bytes;
    let service = RenderService::new(pool, executor, artifacts.clone(), uploads, jobs);

    let router = http::build_router(RouterState {
        http: HttpState {
            service: service.clone(),
            artifacts,
        },
        api: ApiState {
            service: service.clone(),
            api_secret: Arc::from(api_secret),
            max_html_bytes,
        },
    });

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "pressroom::startup",
        addr = %settings.server.addr,
        max_instances = settings.engine.max_instances.get(),
        max_contexts_per_instance = settings.engine.max_contexts_per_instance.get(),
        backpressure = %settings.engine.backpressure,
        "listening"
    );

    let result = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    service.shutdown(settings.server.graceful_shutdown).await;
    info!(target = "pressroom::shutdown", "shutdown complete");

    result
}

async fn run_sweep(settings: config::Settings) -> Result<(), AppError> {
    let artifacts = build_artifact_store(&settings)?;
    let report = artifacts
        .sweep_stale(settings.artifacts.serving_window)
        .await
        .map_err(|err| AppError::unexpected(format!("sweep failed: {err}")))?;

    info!(
        target = "pressroom::sweep",
        directory = %artifacts.root().display(),
        removed = report.removed,
        kept = report.kept,
        "sweep finished"
    );
    Ok(())
}

async fn run_check_engine(
    settings: config::Settings,
    args: config::CheckEngineArgs,
) -> Result<(), AppError> {
    let mut pool_config = PoolConfig::from(&settings.engine);
    pool_config.max_instances = 1;
    pool_config.max_contexts_per_instance = 1;
    let pool = EnginePool::new(pool_config, Arc::new(ChromeLauncher::new(&settings.engine)));
    let executor = RenderExecutor::new(RenderConfig::from(&settings.render));

    let deadline = Deadline::after(settings.jobs.overall_timeout);
    let result = match pool.acquire(&deadline).await {
        Ok(context) => executor
            .render(context, PROBE_HTML, &deadline)
            .await
            .map_err(AppError::from),
        Err(err) => Err(AppError::from(InfraError::engine(err.to_string()))),
    };
    pool.shutdown(Duration::from_secs(5)).await;
    let bytes = result?;

    if let Some(path) = args.output.as_ref() {
        tokio::fs::write(path, &bytes)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?;
    }

    info!(
        target = "pressroom::check_engine",
        result = "ok",
        size_bytes = bytes.len(),
        output = args
            .output
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default(),
        "engine rendered the probe document"
    );
    Ok(())
}

fn build_artifact_store(settings: &config::Settings) -> Result<ArtifactStore, AppError> {
    ArtifactStore::new(&settings.artifacts, DeferredTasks::new()).map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "invalid artifact settings: {err}"
        )))
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!(target = "pressroom::shutdown", "received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!(target = "pressroom::shutdown", "received SIGTERM, starting graceful shutdown");
        },
    }
}
