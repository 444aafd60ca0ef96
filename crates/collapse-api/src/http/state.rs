//! Application state for HTTP handlers.

use std::sync::Arc;

use collapse_server::config::BatcherSettings;
use collapse_server::Batcher;

use crate::upstream::{ForwardedRequest, HttpUpstream};

/// The batcher type the proxy runs.
pub type ProxyBatcher = Batcher<ForwardedRequest, HttpUpstream>;

/// Application state shared across all HTTP handlers.
///
/// Collapsible requests go through `batcher`; everything else is sent
/// straight to `upstream`, which shares its connection pool with the
/// batcher's invoker.
#[derive(Clone)]
pub struct AppState {
    pub batcher: Arc<ProxyBatcher>,
    pub upstream: HttpUpstream,
    pub settings: BatcherSettings,
}

impl AppState {
    /// Creates the state and starts the batcher's flush loop.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(upstream: HttpUpstream, settings: BatcherSettings) -> Self {
        let batcher = Batcher::new(upstream.clone(), settings.to_batcher_config());
        Self {
            batcher: Arc::new(batcher),
            upstream,
            settings,
        }
    }

    /// Handle used to close the batcher once the listener has stopped.
    pub fn batcher(&self) -> Arc<ProxyBatcher> {
        Arc::clone(&self.batcher)
    }
}
