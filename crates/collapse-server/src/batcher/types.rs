//! Data types for the request-collapsing batcher.

use std::time::Duration;

use bytes::Bytes;

/// Default period of the background flush loop.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Identifier assigned to a pending request when it is appended.
///
/// Unique per [`BatchStore`](super::BatchStore) for its whole lifetime.
pub type RequestId = u64;

/// The single result of one upstream call, shared by every member of a batch.
///
/// Only the status code and body are carried. Response headers of the
/// representative call are not replicated to the other members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// Response body. Cloning shares the underlying buffer.
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Creates a response from a status code and body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Response delivered when the upstream invoker returned an error.
    pub fn from_invoke_error(err: &InvokeError) -> Self {
        let status = match err {
            InvokeError::Timeout { .. } => 504,
            InvokeError::InvalidRequest(_) => 400,
            InvokeError::Transport(_) => 502,
        };
        Self::new(status, err.to_string())
    }

    /// Response delivered when the upstream invoker panicked.
    pub fn invoker_fault() -> Self {
        Self::new(500, "upstream invoker failed unexpectedly")
    }

    /// Response delivered to a caller whose own deadline expired while it was
    /// still queued.
    pub fn request_timeout() -> Self {
        Self::new(504, "upstream request timed out")
    }
}

/// Position of a batcher in its lifecycle.
///
/// Transitions only go forward: `Running -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatcherState {
    /// Accepting appends; the periodic flush loop is active.
    Running,
    /// Shutdown signalled; the final flush is in progress.
    Closing,
    /// Terminal. Appends are rejected.
    Closed,
}

/// Runtime settings for a [`Batcher`](super::Batcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatcherConfig {
    /// Period of the background flush loop.
    pub flush_interval: Duration,
    /// Optional per-request deadline applied by [`Batcher::submit`](super::Batcher::submit).
    ///
    /// `None` means a request waits until the next flush or `close`.
    pub request_timeout: Option<Duration>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            request_timeout: None,
        }
    }
}

impl BatcherConfig {
    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Number of distinct keys processed.
    pub keys: usize,
    /// Number of pending requests released.
    pub requests: usize,
    /// Number of upstream invocations (always equal to `keys`).
    pub invocations: usize,
    /// Invocations that returned an error or panicked.
    pub failures: usize,
}

impl FlushReport {
    /// Whether the pass found nothing to flush.
    pub fn is_empty(&self) -> bool {
        self.keys == 0
    }
}

/// Point-in-time copy of the lifetime counters of a batcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests accepted by `append`.
    pub appended: u64,
    /// Requests rejected because the batcher was shutting down.
    pub rejected: u64,
    /// Flush passes that processed at least one batch.
    pub flushes: u64,
    /// Upstream invocations.
    pub invocations: u64,
    /// Upstream invocations that errored or panicked.
    pub failures: u64,
    /// Requests released early because their deadline expired.
    pub timeouts: u64,
}

impl StatsSnapshot {
    /// Fraction of appended requests that did not need their own upstream call.
    pub fn coalescing_ratio(&self) -> f64 {
        if self.appended == 0 {
            0.0
        } else {
            1.0 - (self.invocations as f64 / self.appended as f64)
        }
    }
}

/// Errors raised by the upstream invoker.
///
/// These never propagate to callers as errors; the batcher turns them into an
/// [`UpstreamResponse`] and delivers it to every member of the batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    /// The representative request could not be turned into an upstream call.
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    /// The upstream call did not complete in time.
    #[error("upstream timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Connection or protocol failure talking to the upstream.
    #[error("upstream request failed: {0}")]
    Transport(String),
}

/// Errors surfaced by the batcher to its callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatcherError {
    /// `append` was called after shutdown began. Treat as "service unavailable".
    #[error("batcher is closed")]
    Closed,

    /// The pending request was discarded without a result.
    #[error("pending request dropped before a result was delivered")]
    Dropped,
}

/// Result type for batcher operations.
pub type BatcherResult<T> = Result<T, BatcherError>;
