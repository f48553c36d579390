// SQLGate server entry point

use anyhow::Context;
use clap::Parser;
use sqlgate_core::{GatewayConfig, LogFormat};
use sqlgate_server::{create_router, Gateway};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sqlgate-server")]
#[command(about = "HTTP gateway over PostgreSQL", long_about = None)]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long)]
    port: Option<u16>,
}

fn init_logging(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));

    match config.server.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    init_logging(&config);
    info!("Starting SQLGate v{}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database.describe());

    let addr = config.server.bind_address();
    let gateway = Arc::new(Gateway::new(config));

    // The pool is also created on first use, so a down database only degrades health
    match gateway.init().await {
        Ok(()) => info!("Database connection pool ready"),
        Err(e) => warn!("Database not reachable at startup: {}", e),
    }

    let app = create_router(gateway.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    gateway.shutdown().await;
    info!("SQLGate stopped");
    Ok(())
}
