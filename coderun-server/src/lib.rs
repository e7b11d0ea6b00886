use anyhow::{Context, Result};
use coderun_common::{AppConfig, EngineKind};
use coderun_sandbox::{engine_from_config, SessionService};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod http;

pub use http::{create_router, AppError, AppState};

pub struct ServerArgs {
    pub config: Option<PathBuf>,
    pub port: Option<u16>,
    pub engine: Option<EngineKind>,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
}

/// Load configuration and apply command line overrides
pub fn load_config(args: &ServerArgs) -> Result<AppConfig> {
    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(engine) = args.engine {
        config.sandbox.engine = engine;
    }
    if let Some(log_file) = &args.log_file {
        config.server.log_file = Some(log_file.display().to_string());
    }
    Ok(config)
}

pub async fn run_server_app(args: ServerArgs) -> Result<()> {
    let config = load_config(&args)?;

    // Initialize tracing to the console and, when configured, a log file
    let log_level = if args.verbose { "debug" } else { "info" };

    let (file_layer, _guard) = match config.server.log_file.as_deref() {
        Some(path) => {
            let path = std::path::Path::new(path);
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .context("log_file must name a file")?;
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "coderun_server={},coderun_sandbox={},tower_http={}",
                    log_level, log_level, log_level
                ))
            }),
        )
        .init();

    let engine = engine_from_config(&config.sandbox).context("Failed to initialize sandbox engine")?;
    info!(
        "Sandbox engine: {} (image {})",
        engine.name(),
        config.sandbox.image
    );

    let service = SessionService::new(engine, &config);
    let shutdown = CancellationToken::new();
    let reaper = service.reaper().spawn(shutdown.clone());

    let router = create_router(AppState::new(service.clone()), &config.server.allowed_origins);
    let bind_addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Server running on {}", listener.local_addr()?);

    tokio::spawn(watch_signals(shutdown.clone()));
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server error")?;

    info!("Shutting down");
    shutdown.cancel();
    if let Err(e) = reaper.await {
        tracing::warn!("Idle reaper task failed: {}", e);
    }
    service.shutdown().await;
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = shutdown.cancelled() => return,
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
