//! uxmirror daemon — supervises UxPlay screen-mirroring receivers
//!
//! Responsibilities:
//! - Read configuration (receivers, binary, listen address)
//! - Own the process registry for the lifetime of the program
//! - Serve the JSON control API used by the front end
//! - Stop every receiver on SIGINT/SIGTERM before exiting

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uxmirror_registry::ProcessRegistry;

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config::config_path();
    let config = config::load_config(&config_path)?;

    init_logging(&config.daemon.log_level)?;

    info!("uxmirror daemon v{} starting...", env!("CARGO_PKG_VERSION"));
    if config_path.exists() {
        info!("Configuration loaded from {}", config_path.display());
    } else {
        warn!("Config file not found at {}, using defaults", config_path.display());
    }

    let binary = config.receiver_binary();
    info!(
        "Receiver binary: {binary}, {} receiver(s) configured",
        config.receivers.len()
    );

    let stop_timeout = config.stop_timeout();
    let listen_addr = config.daemon.listen_addr.clone();
    let registry = Arc::new(ProcessRegistry::new());
    let state = api::ApiState::new(registry.clone(), Arc::new(config), binary);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind control API on {listen_addr}"))?;
    info!("Control API listening on http://{listen_addr}");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Control API server failed")?;

    let stopped = tokio::task::spawn_blocking(move || registry.shutdown(stop_timeout))
        .await
        .context("Receiver shutdown task failed")?;
    info!("uxmirror daemon shut down cleanly ({stopped} receiver(s) stopped)");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{level}'"))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_level(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
