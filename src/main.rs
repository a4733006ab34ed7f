use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slomo::config::{SlomoConfig, StoreBackend, StoreConfig};
use slomo::http::{self, HttpServer};
use slomo::ratelimit::Gate;
use slomo::store::{MemoryStore, RedisStore, RequestLogStore};

/// Sliding-window admission gate in front of an HTTP application.
#[derive(Parser, Debug)]
#[command(name = "slomo", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Slomo admission gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => SlomoConfig::from_file(path)?,
        None => SlomoConfig::from_env()?,
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        window_secs = config.limiter.window_secs,
        capacity = config.limiter.capacity,
        backend = ?config.store.backend,
        on_store_failure = ?config.limiter.on_store_failure,
        "Configuration loaded"
    );

    let store = connect_store(&config.store).await?;
    let gate = Arc::new(Gate::from_config(store, &config.limiter, &config.store));
    info!(key = %gate.log_key(), "Admission gate initialized");

    let server = HttpServer::bind(config.server.listen_addr, gate, http::app()).await?;

    // Run the server with graceful shutdown on Ctrl+C or SIGTERM
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Slomo admission gate stopped");
    Ok(())
}

async fn connect_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn RequestLogStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory request log; limits are not shared between instances");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.redis_url is required for the redis backend"))?;
            let store = tokio::time::timeout(config.timeout(), RedisStore::connect(url))
                .await
                .map_err(|_| anyhow::anyhow!("timed out connecting to Redis at {}", url))??;
            Ok(Arc::new(store))
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
