//! collapse-server: request collapsing in front of an upstream service
//!
//! This crate contains the coalescing engine and its configuration:
//! - Batcher that groups concurrent requests per key
//! - One upstream call per key per flush, result fanned out to all waiters
//! - Periodic flush loop and graceful drain on close
//! - Configuration management
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              collapse-server                 │
//! ├─────────────────────────────────────────────┤
//! │  config.rs   - Configuration management     │
//! │  batcher/    - Request collapsing           │
//! │    store.rs       - Key -> batch mapping    │
//! │    pending.rs     - Waiters and completion  │
//! │    handler.rs     - Append, flush, close    │
//! │    invoker.rs     - Upstream call seam      │
//! └─────────────────────────────────────────────┘
//! ```

pub mod batcher;
pub mod config;

// Re-exports for convenience
pub use batcher::{
    Batcher, BatcherConfig, BatcherError, BatcherState, UpstreamInvoker, UpstreamResponse,
};
pub use config::{ConfigLoadError, ProxyConfig};
