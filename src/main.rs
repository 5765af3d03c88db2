//! Entry point: loads configuration, assembles the core runtime, and
//! serves the ingress HTTP API until a shutdown signal arrives.

use grace_core::config::CoreConfig;
use grace_core::{init_logging, CoreRuntime, RuntimeOverrides};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_SUCCESS: u8 = 0;
const EXIT_GENERIC_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_PORT_IN_USE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(StartupError::Config(msg)) => {
            tracing::error!("configuration error: {msg}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
        Err(StartupError::PortInUse(port)) => {
            tracing::error!(
                "port {port} is already in use; set GRACE_PORT to choose a different port"
            );
            ExitCode::from(EXIT_PORT_IN_USE)
        }
        Err(StartupError::Generic(msg)) => {
            tracing::error!("{msg}");
            ExitCode::from(EXIT_GENERIC_FAILURE)
        }
    }
}

enum StartupError {
    Config(String),
    PortInUse(u16),
    Generic(String),
}

async fn run() -> Result<(), StartupError> {
    let config_path = std::env::var("GRACE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    let mut config =
        CoreConfig::load(&config_path).map_err(|e| StartupError::Config(e.to_string()))?;
    config.apply_env_overrides();

    tracing::info!("grace-core v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("configuration loaded from {}", config_path.display());

    let port = config.general.port;
    let runtime = CoreRuntime::new(config, RuntimeOverrides::default());

    runtime
        .register_default_playbooks(std::collections::HashMap::new())
        .await;
    runtime.spawn_background_tasks();

    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            return Err(StartupError::PortInUse(port))
        }
        Err(e) => return Err(StartupError::Generic(format!("failed to bind {addr}: {e}"))),
    };

    tracing::info!("ingress API listening on {addr}");

    let router = runtime.router();
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(runtime))
        .await
        .map_err(|e| StartupError::Generic(format!("server error: {e}")))?;

    Ok(())
}

async fn shutdown_signal(runtime: CoreRuntime) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    runtime.shutdown(std::time::Duration::from_secs(30)).await;
}
