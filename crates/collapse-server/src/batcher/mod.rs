//! Request-collapsing batcher.
//!
//! Concurrent requests that share a coalescing key are grouped into a batch.
//! Each flush pass issues one upstream call per batch, using the first request
//! of the batch as the representative, and hands the single result to every
//! member:
//!
//! 1. **Append**: the caller queues a [`PendingRequest`] and awaits its
//!    [`Completion`].
//! 2. **Flush**: on every tick of the background loop (and once during
//!    [`Batcher::close`]) the whole [`BatchStore`] is swapped out under its
//!    lock, the lock is released, and the batches are processed concurrently.
//! 3. **Fan-out**: the result, or a failure result if the invoker erred or
//!    panicked, is delivered to every member in insertion order.
//!
//! # Lifecycle
//!
//! ```text
//! Running --close()--> Closing --final flush--> Closed
//! ```
//!
//! Appends are rejected with [`BatcherError::Closed`] as soon as `close` has
//! been called. Requests accepted before that are answered by the final flush.
//!
//! # Limitations
//!
//! Only status and body of the representative response reach the other
//! members; response headers are not replicated. Every member receives the
//! representative's result even if its own payload differed, so callers should
//! only collapse idempotent requests.

mod handler;
mod invoker;
mod pending;
mod store;
mod types;

pub use handler::Batcher;
pub use invoker::UpstreamInvoker;
pub use pending::{Completion, PendingRequest};
pub use store::{Batch, BatchStore};
pub use types::{
    BatcherConfig, BatcherError, BatcherResult, BatcherState, FlushReport, InvokeError,
    RequestId, StatsSnapshot, UpstreamResponse, DEFAULT_FLUSH_INTERVAL,
};
