//! Observability for the proxy: structured logging and Prometheus metrics.

mod logging;
mod metrics;

pub use logging::{create_json_layer, init_logging, parse_log_level, LoggingConfig};
pub use metrics::{init_metrics, metrics_handler, record_proxied_request, MetricsError, MetricsState};
