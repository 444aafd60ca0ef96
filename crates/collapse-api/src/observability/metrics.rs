//! Prometheus metrics infrastructure.
//!
//! Metrics are recorded with the `metrics` crate facade, by the batcher and by
//! the proxy handler, and exposed through `metrics-exporter-prometheus`.
//!
//! # Metrics Exposed
//!
//! - `collapse_requests_appended_total` - Requests accepted into a batch
//! - `collapse_requests_rejected_total` - Requests refused during shutdown
//! - `collapse_upstream_invocations_total` - Upstream calls made for batches
//! - `collapse_upstream_failures_total` - Batches answered with a failure
//! - `collapse_batch_size` - Members per flushed batch
//! - `collapse_flush_duration_seconds` - Wall time of one flush pass
//! - `collapse_queue_wait_seconds` - Time a request waited before its result
//! - `collapse_request_timeouts_total` - Requests withdrawn at their deadline
//! - `collapse_proxy_requests_total` - Client requests by mode and status

use std::sync::Arc;

use axum::{extract::State, http::header::CONTENT_TYPE, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Shared state containing the Prometheus handle for metrics rendering.
#[derive(Clone)]
pub struct MetricsState {
    handle: Arc<PrometheusHandle>,
}

impl MetricsState {
    pub fn new(handle: PrometheusHandle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Renders the current metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Error type for metrics initialization.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install Prometheus recorder: recorder already installed")]
    AlreadyInstalled,
}

/// Installs the global Prometheus recorder.
///
/// Must be called once, before the batcher is created, or the batcher's
/// early metrics are lost.
pub fn init_metrics() -> Result<MetricsState, MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|_| MetricsError::AlreadyInstalled)?;

    describe_metrics();

    Ok(MetricsState::new(handle))
}

fn describe_metrics() {
    metrics::describe_counter!(
        "collapse_requests_appended_total",
        "Total number of requests accepted into a batch"
    );
    metrics::describe_counter!(
        "collapse_requests_rejected_total",
        "Total number of requests rejected because the batcher was closing"
    );
    metrics::describe_counter!(
        "collapse_upstream_invocations_total",
        "Total number of upstream calls made on behalf of a batch"
    );
    metrics::describe_counter!(
        "collapse_upstream_failures_total",
        "Total number of batches answered with a failure result"
    );
    metrics::describe_histogram!(
        "collapse_batch_size",
        "Number of requests answered by one upstream call"
    );
    metrics::describe_histogram!(
        "collapse_flush_duration_seconds",
        "Duration of one flush pass in seconds"
    );
    metrics::describe_histogram!(
        "collapse_queue_wait_seconds",
        "Time from append to result delivery in seconds"
    );
    metrics::describe_counter!(
        "collapse_request_timeouts_total",
        "Total number of requests withdrawn from their batch at the deadline"
    );
    metrics::describe_counter!(
        "collapse_proxy_requests_total",
        "Total number of client requests by mode (collapsed, direct) and status"
    );
}

/// Prometheus exposition format content type.
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Handler for the metrics endpoint.
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    ([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], state.render())
}

/// Records one answered client request.
///
/// `mode` is `"collapsed"` when the request went through the batcher and
/// `"direct"` when it was forwarded one-to-one.
pub fn record_proxied_request(mode: &'static str, status: u16) {
    let labels = [("mode", mode.to_string()), ("status", status.to_string())];
    metrics::counter!("collapse_proxy_requests_total", &labels).increment(1);
}
