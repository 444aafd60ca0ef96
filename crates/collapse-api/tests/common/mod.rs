//! Shared fixtures for proxy integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{Method, Uri},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use collapse_api::http::{create_router, AppState, ProxyBatcher};
use collapse_api::server::serve_with_shutdown;
use collapse_api::upstream::HttpUpstream;
use collapse_server::config::BatcherSettings;

/// An in-process upstream that counts the requests it receives.
pub struct Upstream {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Starts an upstream that answers `"<METHOD> <uri> #<hit>"` after `delay`.
pub async fn spawn_upstream(delay: Duration) -> Upstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    let app = Router::new().fallback(move |method: Method, uri: Uri| {
        let counter = Arc::clone(&counter);
        async move {
            let hit = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(delay).await;
            format!("{method} {uri} #{hit}")
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Upstream {
        base_url: format!("http://{addr}"),
        hits,
    }
}

/// A proxy running on its own listener.
pub struct Proxy {
    pub url: String,
    pub batcher: Arc<ProxyBatcher>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl Proxy {
    /// Triggers graceful shutdown and waits for the server and drain to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server.await.unwrap().unwrap();
        }
    }

    pub async fn wait_for_pending(&self, expected: usize) {
        for _ in 0..1000 {
            if self.batcher.pending_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "expected {expected} pending requests, found {}",
            self.batcher.pending_count()
        );
    }
}

/// Starts a proxy in front of `upstream_url` flushing every `flush_interval_ms`.
pub async fn spawn_proxy(upstream_url: &str, flush_interval_ms: u64) -> Proxy {
    let upstream = HttpUpstream::new(upstream_url, Duration::from_secs(5)).unwrap();
    let settings = BatcherSettings {
        flush_interval_ms,
        ..Default::default()
    };
    let state = AppState::new(upstream, settings);
    let batcher = state.batcher();
    let router = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();

    let server = tokio::spawn(serve_with_shutdown(
        listener,
        router,
        Arc::clone(&batcher),
        async move {
            let _ = rx.await;
        },
    ));

    Proxy {
        url: format!("http://{addr}"),
        batcher,
        shutdown: Some(tx),
        server: Some(server),
    }
}
