//! Conduit engine entry point
//!
//! Loads configuration, starts listeners and the worker pool, and drains on
//! SIGTERM or SIGINT.

use anyhow::Context;
use clap::Parser;
use conduit::{config::Config, logging, Engine};

#[derive(Debug, Parser)]
#[clap(name = "conduit-engine", version, about = "Healthcare message integration engine")]
struct Args {
    /// Configuration file (overrides CONDUIT_CONFIG)
    #[clap(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match args.config {
        Some(path) => Config::load_from(Some(&path)),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let _telemetry_guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging/telemetry")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = config.logging.deployment_environment,
        routes = config.routes.len(),
        "Starting Conduit"
    );

    let engine = Engine::start(config)
        .await
        .context("Failed to start engine")?;

    tracing::info!("Health check: http://{}/health", engine.http_addr());
    for route in &engine.config().routes {
        if let Some(addr) = engine.mllp_addr(&route.name) {
            tracing::info!(route = %route.name, "MLLP listening on {}", addr);
        }
    }

    shutdown_signal().await;
    engine.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
    let sigint = tokio::signal::ctrl_c();

    tokio::select! {
        _ = sigint => {
            tracing::info!("SIGINT received, draining...");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, draining...");
        }
    }
}

/// Wait for shutdown signal (SIGINT only on non-Unix platforms)
#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining...");
}
