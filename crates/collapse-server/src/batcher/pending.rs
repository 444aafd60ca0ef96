//! Pending requests and their one-shot completion signal.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::oneshot;

use super::types::{BatcherError, UpstreamResponse};

/// One inbound call waiting for the result of its batch.
///
/// The sink and the completion signal are the same oneshot sender: writing the
/// result is what fires the signal, so a caller can never observe completion
/// without the result.
pub struct PendingRequest<P> {
    key: String,
    payload: P,
    sink: oneshot::Sender<UpstreamResponse>,
    created_at: Instant,
}

impl<P> PendingRequest<P> {
    /// Creates a pending request and the completion the caller waits on.
    pub fn new(key: impl Into<String>, payload: P) -> (Self, Completion) {
        let (sink, rx) = oneshot::channel();
        let pending = Self {
            key: key.into(),
            payload,
            sink,
            created_at: Instant::now(),
        };
        (pending, Completion { rx })
    }

    /// The coalescing key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The original inbound request.
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Time since the request was created.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Writes the result and fires the completion. Consumes the request, so
    /// delivery happens at most once.
    ///
    /// Returns `false` if the caller stopped waiting.
    pub(crate) fn deliver(self, response: UpstreamResponse) -> bool {
        self.sink.send(response).is_ok()
    }
}

impl<P> std::fmt::Debug for PendingRequest<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// The caller's half of a [`PendingRequest`].
///
/// Resolves once the batch the request belongs to has been flushed. If the
/// request is discarded without a result (for instance it was rejected by a
/// closed batcher) it resolves to [`BatcherError::Dropped`] instead of hanging.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<UpstreamResponse>,
}

impl Completion {
    /// Returns the result if it has already been delivered.
    ///
    /// Once this returned `Some`, the completion must not be awaited.
    pub fn try_result(&mut self) -> Option<UpstreamResponse> {
        self.rx.try_recv().ok()
    }
}

impl Future for Completion {
    type Output = Result<UpstreamResponse, BatcherError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| BatcherError::Dropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_fires_completion_with_result() {
        let (pending, completion) = PendingRequest::new("/foo", ());
        assert_eq!(pending.key(), "/foo");

        assert!(pending.deliver(UpstreamResponse::new(200, "ok")));

        let response = completion.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"ok");
    }

    #[tokio::test]
    async fn test_dropped_pending_resolves_to_error() {
        let (pending, completion) = PendingRequest::new("/foo", ());
        drop(pending);

        assert_eq!(completion.await.unwrap_err(), BatcherError::Dropped);
    }

    #[test]
    fn test_deliver_reports_caller_gone() {
        let (pending, completion) = PendingRequest::new("/foo", ());
        drop(completion);

        assert!(!pending.deliver(UpstreamResponse::new(200, "ok")));
    }

    #[test]
    fn test_age_grows_from_creation() {
        let (pending, _completion) = PendingRequest::new("/foo", ());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(pending.age() >= std::time::Duration::from_millis(5));
    }

    #[test]
    fn test_try_result_before_and_after_delivery() {
        let (pending, mut completion) = PendingRequest::new("/foo", 7u32);
        assert_eq!(*pending.payload(), 7);
        assert!(completion.try_result().is_none());

        pending.deliver(UpstreamResponse::new(204, ""));
        assert_eq!(completion.try_result().map(|r| r.status), Some(204));
    }
}
