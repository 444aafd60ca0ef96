//! Batch store: coalescing key to the requests waiting under it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::pending::PendingRequest;
use super::types::{BatcherError, BatcherState, RequestId};

/// Requests sharing one key within one flush window, in arrival order.
pub struct Batch<P> {
    key: String,
    members: Vec<(RequestId, PendingRequest<P>)>,
}

impl<P> Batch<P> {
    /// The coalescing key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of waiting requests.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the batch has no members. Never true for a drained batch.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The first-inserted member, whose payload is forwarded upstream.
    pub fn representative(&self) -> Option<&PendingRequest<P>> {
        self.members.first().map(|(_, pending)| pending)
    }

    /// Consumes the batch, yielding members in insertion order.
    pub fn into_members(self) -> impl Iterator<Item = PendingRequest<P>> {
        self.members.into_iter().map(|(_, pending)| pending)
    }
}

struct StoreInner<P> {
    batches: HashMap<String, Batch<P>>,
    state: BatcherState,
    next_id: RequestId,
    queued: usize,
    /// Flush passes holding drained batches whose members are not all answered.
    flushing: usize,
}

/// The only shared mutable state of a batcher.
///
/// Every access goes through one mutex, and the lock is only held for O(1) map
/// operations. Nothing that can block or await runs while it is held.
///
/// The lifecycle state lives under the same lock as the batches, which is what
/// makes an `append` racing with shutdown either land in the final drain or be
/// rejected, never both and never neither.
pub struct BatchStore<P> {
    inner: Mutex<StoreInner<P>>,
}

impl<P> BatchStore<P> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                batches: HashMap::new(),
                state: BatcherState::Running,
                next_id: 0,
                queued: 0,
                flushing: 0,
            }),
        }
    }

    // No user code runs under the lock, so a poisoned mutex still holds
    // consistent data.
    fn lock(&self) -> MutexGuard<'_, StoreInner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `pending` at the tail of the batch for its key.
    ///
    /// Rejected once shutdown has begun. The rejected request is dropped, which
    /// resolves its completion to an error instead of leaving it waiting.
    pub fn append(&self, pending: PendingRequest<P>) -> Result<RequestId, BatcherError> {
        let mut inner = self.lock();
        if inner.state != BatcherState::Running {
            return Err(BatcherError::Closed);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.queued += 1;

        let key = pending.key().to_string();
        inner
            .batches
            .entry(key)
            .or_insert_with_key(|key| Batch {
                key: key.clone(),
                members: Vec::new(),
            })
            .members
            .push((id, pending));

        Ok(id)
    }

    /// Takes every batch for a flush pass and, if there were any, counts the
    /// pass as in flight until [`end_flush`](Self::end_flush).
    ///
    /// Taking the batches and registering the pass happen under one lock
    /// acquisition, so [`flushes_in_flight`](Self::flushes_in_flight) never
    /// misses requests that have left the store but are not answered yet.
    pub(crate) fn begin_flush(&self) -> Vec<Batch<P>> {
        let mut inner = self.lock();
        if inner.batches.is_empty() {
            return Vec::new();
        }
        inner.queued = 0;
        inner.flushing += 1;
        std::mem::take(&mut inner.batches).into_values().collect()
    }

    /// Marks a pass started by [`begin_flush`](Self::begin_flush) as finished.
    pub(crate) fn end_flush(&self) {
        let mut inner = self.lock();
        inner.flushing = inner.flushing.saturating_sub(1);
    }

    /// Number of flush passes still delivering results.
    pub fn flushes_in_flight(&self) -> usize {
        self.lock().flushing
    }

    /// Removes one request that has not been drained yet.
    ///
    /// Returns `None` if a flush already took it. An emptied batch is removed,
    /// so the next append for that key starts a fresh one.
    pub fn remove(&self, key: &str, id: RequestId) -> Option<PendingRequest<P>> {
        let mut inner = self.lock();
        let batch = inner.batches.get_mut(key)?;
        let position = batch.members.iter().position(|(member, _)| *member == id)?;
        let (_, pending) = batch.members.remove(position);
        if batch.members.is_empty() {
            inner.batches.remove(key);
        }
        inner.queued -= 1;
        Some(pending)
    }

    /// Moves `Running` to `Closing`. Returns `false` if shutdown had already begun.
    pub fn begin_close(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != BatcherState::Running {
            return false;
        }
        inner.state = BatcherState::Closing;
        true
    }

    /// Marks the store terminally closed.
    pub fn finish_close(&self) {
        self.lock().state = BatcherState::Closed;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BatcherState {
        self.lock().state
    }

    /// Number of requests waiting across all keys.
    pub fn len(&self) -> usize {
        self.lock().queued
    }

    /// Whether no request is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with a waiting batch.
    pub fn key_count(&self) -> usize {
        self.lock().batches.len()
    }
}

impl<P> Default for BatchStore<P> {
    fn default() -> Self {
        Self::new()
    }
}
