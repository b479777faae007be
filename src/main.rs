use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use speedbump::config::SpeedbumpConfig;
use speedbump::http::{build_router, CounterBackend, HttpServer};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Sliding-window rate limiting in front of HTTP routes.
#[derive(Debug, Parser)]
#[command(name = "speedbump", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("Starting Speedbump Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => SpeedbumpConfig::from_file(path)?,
        None => {
            warn!("No configuration file given, using defaults");
            SpeedbumpConfig::default()
        }
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        rules = config.rules.len(),
        failure_policy = ?config.failure_policy,
        "Configuration loaded"
    );

    // A backend that cannot be reached aborts startup
    let backend = CounterBackend::connect(&config.store).await?;
    let router = build_router(&config, &backend)?;

    HttpServer::new(config.server.listen_addr, router)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Speedbump Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
