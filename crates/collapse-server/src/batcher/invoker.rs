//! The upstream call a batch is collapsed into.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{InvokeError, UpstreamResponse};

/// Performs the real work for one representative request.
///
/// Called at most once per key per flush pass. Calls for different keys of
/// the same pass run concurrently, so implementations must be safe to share.
#[async_trait]
pub trait UpstreamInvoker<P>: Send + Sync + 'static
where
    P: Send + Sync,
{
    /// Forwards `payload` upstream and returns its status and body.
    ///
    /// Non-success statuses are ordinary responses. Errors are converted into
    /// a failure response by the batcher and delivered like any other result.
    async fn invoke(&self, payload: &P) -> Result<UpstreamResponse, InvokeError>;
}

#[async_trait]
impl<P, T> UpstreamInvoker<P> for Arc<T>
where
    P: Send + Sync,
    T: UpstreamInvoker<P> + ?Sized,
{
    async fn invoke(&self, payload: &P) -> Result<UpstreamResponse, InvokeError> {
        (**self).invoke(payload).await
    }
}
