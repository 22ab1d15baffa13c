//! lb-proxy: load-balancing HTTP/1.1 reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net (listener, worker threads)
//!                  │
//!                  ▼
//!                http (server, exchange) ──▶ routing (route → backend group)
//!                  │
//!                  ▼
//!                load_balancer (sticky / round robin, per-worker pools)
//!                  │            └── health (error policy, recovery probes)
//!                  ▼
//!                net::upstream (HTTP/1.1 client connection) ──▶ Backend
//!
//!     config (TOML, hot reload) · admin API · observability · lifecycle
//! ```

use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use lb_proxy::config::{load_config, watcher::ConfigWatcher, ProxyConfig};
use lb_proxy::http::HttpServer;
use lb_proxy::lifecycle::{signals::spawn_signal_handler, Shutdown};
use lb_proxy::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "lb-proxy")]
#[command(about = "Load-balancing HTTP/1.1 reverse proxy", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Watched for changes.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    logging::init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        "lb-proxy starting"
    );
    tracing::info!(
        bind_address = %config.listener.bind_address,
        workers = config.listener.workers,
        routes = config.routes.len(),
        backends = config.backends.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    // The watcher handle stops watching when dropped.
    let (updates, _watcher) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (updates, Some(watcher.run()?))
        }
        None => {
            let (_tx, updates) = mpsc::unbounded_channel();
            (updates, None)
        }
    };

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    HttpServer::new(config)
        .run(listener, updates, shutdown.subscribe())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
