//! Collapsing proxy binary
//!
//! Sits in front of one upstream and answers concurrent identical requests
//! with a single upstream call.
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! collapse-proxy --config proxy.yaml
//!
//! # With environment variables only
//! COLLAPSE_UPSTREAM__BASE_URL=http://backend:8081 collapse-proxy
//! ```

use std::net::SocketAddr;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use collapse_api::http::{create_router_with_body_limit, create_router_with_observability, AppState};
use collapse_api::observability::{init_logging, init_metrics, LoggingConfig};
use collapse_api::server::serve_with_shutdown;
use collapse_api::upstream::HttpUpstream;
use collapse_server::ProxyConfig;

/// Collapsed-forwarding HTTP proxy
#[derive(Parser, Debug)]
#[command(name = "collapse-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if let Some(config_path) = args.config {
        ProxyConfig::load(&config_path)?
    } else {
        ProxyConfig::from_env()?
    };

    init_logging(LoggingConfig::from_settings(&config.logging));

    info!(version = env!("CARGO_PKG_VERSION"), "Starting collapse proxy");

    // Installed before the batcher exists so its first flushes are recorded.
    let metrics_state = if config.metrics.enabled {
        Some(init_metrics()?)
    } else {
        None
    };

    let upstream = HttpUpstream::from_settings(&config.upstream)?;
    info!(
        upstream = upstream.base_url(),
        flush_interval_ms = config.batcher.flush_interval_ms,
        coalesce_methods = ?config.batcher.coalesce_methods,
        "Upstream configured"
    );

    let state = AppState::new(upstream, config.batcher.clone());
    let batcher = state.batcher();

    let router = match metrics_state {
        Some(metrics_state) => {
            info!(path = %config.metrics.path, "Metrics enabled");
            create_router_with_observability(
                state,
                metrics_state,
                &config.metrics.path,
                config.server.body_limit_bytes,
            )
        }
        None => create_router_with_body_limit(state, config.server.body_limit_bytes),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    serve_with_shutdown(listener, router, batcher, shutdown_signal()).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
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
