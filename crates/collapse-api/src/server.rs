//! Listener lifecycle: serve until shutdown, then drain the batcher.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::http::ProxyBatcher;

/// Serves `router` on `listener` until `shutdown` resolves.
///
/// Once `shutdown` fires the listener stops accepting and the batcher starts
/// closing at the same time, so requests already queued are answered by the
/// final flush instead of waiting for the next tick. Returns after both the
/// in-flight connections and the drain have finished.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    router: Router,
    batcher: Arc<ProxyBatcher>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let draining = Arc::clone(&batcher);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown requested, draining pending requests");
            tokio::spawn(async move { draining.close().await });
        })
        .await?;

    // Waits for the drain started above.
    batcher.close().await;
    info!("proxy stopped");
    Ok(())
}
