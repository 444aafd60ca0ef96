//! Batcher implementation: append, flush, the periodic flush loop and close.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::invoker::UpstreamInvoker;
use super::pending::PendingRequest;
use super::store::{Batch, BatchStore};
use super::types::{
    BatcherConfig, BatcherResult, BatcherState, FlushReport, RequestId, StatsSnapshot,
    UpstreamResponse,
};

/// Lifetime counters, updated without taking the store lock.
#[derive(Debug, Default)]
struct BatcherStats {
    appended: AtomicU64,
    rejected: AtomicU64,
    flushes: AtomicU64,
    invocations: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

impl BatcherStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of processing one batch within a flush pass.
struct BatchOutcome {
    size: usize,
    failed: bool,
}

/// State shared between the batcher handle and its flush loop.
struct Shared<P, I> {
    store: BatchStore<P>,
    invoker: I,
    stats: BatcherStats,
    /// Signalled each time a flush pass finishes delivering.
    flush_done: Notify,
}

/// Keeps a flush pass counted as in flight until it is dropped, including
/// when the pass itself is cancelled mid-delivery.
struct FlushGuard<'a, P> {
    store: &'a BatchStore<P>,
    done: &'a Notify,
}

impl<P> Drop for FlushGuard<'_, P> {
    fn drop(&mut self) {
        self.store.end_flush();
        self.done.notify_waiters();
    }
}

impl<P, I> Shared<P, I>
where
    P: Send + Sync + 'static,
    I: UpstreamInvoker<P>,
{
    async fn flush(&self) -> FlushReport {
        // Snapshot and clear under the lock, then release it before any
        // upstream call. Holding it across `invoke` would serialize unrelated
        // keys behind the slowest upstream and block every `append`.
        let batches = self.store.begin_flush();
        if batches.is_empty() {
            return FlushReport::default();
        }
        let _in_flight = FlushGuard {
            store: &self.store,
            done: &self.flush_done,
        };

        let started = Instant::now();
        let outcomes = join_all(batches.into_iter().map(|batch| self.process_batch(batch))).await;

        let report = FlushReport {
            keys: outcomes.len(),
            requests: outcomes.iter().map(|o| o.size).sum(),
            invocations: outcomes.len(),
            failures: outcomes.iter().filter(|o| o.failed).count(),
        };

        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .invocations
            .fetch_add(report.invocations as u64, Ordering::Relaxed);
        self.stats
            .failures
            .fetch_add(report.failures as u64, Ordering::Relaxed);
        metrics::histogram!("collapse_flush_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        debug!(
            keys = report.keys,
            requests = report.requests,
            failures = report.failures,
            "flush complete"
        );
        report
    }

    /// Waits until no flush pass holds undelivered requests.
    async fn wait_for_flushes(&self) {
        loop {
            // Registered before the check so a pass ending in between is seen.
            let done = self.flush_done.notified();
            if self.store.flushes_in_flight() == 0 {
                return;
            }
            done.await;
        }
    }

    /// Invokes the upstream once for the batch and fans the result out.
    ///
    /// Every member is released no matter how the invocation ends.
    async fn process_batch(&self, batch: Batch<P>) -> BatchOutcome {
        let size = batch.len();
        debug!(key = batch.key(), size, "flushing batch");
        metrics::histogram!("collapse_batch_size").record(size as f64);
        metrics::counter!("collapse_upstream_invocations_total").increment(1);

        let Some(representative) = batch.representative() else {
            return BatchOutcome { size, failed: false };
        };

        let invocation = AssertUnwindSafe(self.invoker.invoke(representative.payload()))
            .catch_unwind()
            .await;

        let (response, failed) = match invocation {
            Ok(Ok(response)) => (response, false),
            Ok(Err(err)) => {
                warn!(key = batch.key(), error = %err, "upstream invocation failed");
                (UpstreamResponse::from_invoke_error(&err), true)
            }
            Err(_) => {
                warn!(key = batch.key(), "upstream invoker panicked");
                (UpstreamResponse::invoker_fault(), true)
            }
        };

        if failed {
            metrics::counter!("collapse_upstream_failures_total").increment(1);
        }

        for member in batch.into_members() {
            metrics::histogram!("collapse_queue_wait_seconds").record(member.age().as_secs_f64());
            member.deliver(response.clone());
        }

        BatchOutcome { size, failed }
    }
}

/// Groups concurrent requests by key and answers each group with a single
/// upstream call.
///
/// Requests are collected by [`append`](Self::append) and released by
/// [`flush`](Self::flush), which runs on a fixed interval in a background task
/// and once more during [`close`](Self::close).
///
/// Must be created inside a tokio runtime.
pub struct Batcher<P, I> {
    shared: Arc<Shared<P, I>>,
    config: BatcherConfig,
    /// Lifecycle broadcast. The flush loop exits when it leaves `Running`, and
    /// every `close` caller waits on it for `Closed`.
    phase: Arc<watch::Sender<BatcherState>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl<P, I> Batcher<P, I>
where
    P: Send + Sync + 'static,
    I: UpstreamInvoker<P>,
{
    /// Creates a batcher and starts its periodic flush loop.
    pub fn new(invoker: I, config: BatcherConfig) -> Self {
        Self::with_store(BatchStore::new(), invoker, config)
    }

    /// Creates a batcher around an existing store.
    pub fn with_store(store: BatchStore<P>, invoker: I, config: BatcherConfig) -> Self {
        let shared = Arc::new(Shared {
            store,
            invoker,
            stats: BatcherStats::default(),
            flush_done: Notify::new(),
        });
        let (phase, shutdown) = watch::channel(BatcherState::Running);
        let phase = Arc::new(phase);

        let flush_task = tokio::spawn(run_flush_loop(
            Arc::clone(&shared),
            config.flush_interval,
            shutdown,
        ));

        info!(
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "batcher started"
        );

        Self {
            shared,
            config,
            phase,
            flush_task: Mutex::new(Some(flush_task)),
        }
    }

    /// Queues `pending` behind any other request with the same key.
    ///
    /// Does not wait for the result; the caller awaits the
    /// [`Completion`](super::Completion) returned alongside the request.
    /// Fails with [`BatcherError::Closed`](super::BatcherError::Closed) once
    /// shutdown has begun.
    pub fn append(&self, pending: PendingRequest<P>) -> BatcherResult<RequestId> {
        match self.shared.store.append(pending) {
            Ok(id) => {
                self.shared.stats.appended.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("collapse_requests_appended_total").increment(1);
                Ok(id)
            }
            Err(err) => {
                self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("collapse_requests_rejected_total").increment(1);
                debug!("append rejected: batcher is shutting down");
                Err(err)
            }
        }
    }

    /// Appends a request for `key` and waits for its result.
    ///
    /// With a configured request timeout, a request still queued when the
    /// deadline passes is withdrawn from its batch and answered with
    /// [`UpstreamResponse::request_timeout`]; the rest of the batch is not
    /// affected. A request whose batch is already in flight keeps waiting for
    /// that batch's result.
    pub async fn submit(&self, key: impl Into<String>, payload: P) -> BatcherResult<UpstreamResponse> {
        let key = key.into();
        let (pending, mut completion) = PendingRequest::new(key.clone(), payload);
        let id = self.append(pending)?;

        let Some(deadline) = self.config.request_timeout else {
            return completion.await;
        };

        match tokio::time::timeout(deadline, &mut completion).await {
            Ok(result) => result,
            Err(_) => match self.cancel(&key, id) {
                Some(_) => {
                    self.shared.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("collapse_request_timeouts_total").increment(1);
                    Ok(UpstreamResponse::request_timeout())
                }
                None => completion.await,
            },
        }
    }

    /// Withdraws a request that has not been picked up by a flush yet.
    ///
    /// The returned request is never delivered; dropping it resolves its
    /// completion to an error.
    pub fn cancel(&self, key: &str, id: RequestId) -> Option<PendingRequest<P>> {
        let removed = self.shared.store.remove(key, id)?;
        debug!(key, id, "pending request withdrawn before flush");
        Some(removed)
    }

    /// Releases every batch collected so far: one upstream call per key, its
    /// result delivered to every member.
    ///
    /// Batches appended while this runs belong to the next pass.
    pub async fn flush(&self) -> FlushReport {
        self.shared.flush().await
    }

    /// Stops the flush loop and drains whatever is still queued.
    ///
    /// When this returns, every request appended before the call has been
    /// answered, including those taken by a flush pass that was already
    /// running, and later appends are rejected. Calling it again, or
    /// concurrently, waits for the same shutdown to finish.
    ///
    /// The shutdown runs in its own task, so dropping this future does not
    /// stop it from reaching `Closed`.
    pub async fn close(&self) {
        let mut phase = self.phase.subscribe();

        if self.shared.store.begin_close() {
            info!("batcher closing");
            self.phase.send_replace(BatcherState::Closing);

            let flush_task = self
                .flush_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            tokio::spawn(drain_and_close(
                Arc::clone(&self.shared),
                Arc::clone(&self.phase),
                flush_task,
            ));
        }

        let _ = phase.wait_for(|state| *state == BatcherState::Closed).await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BatcherState {
        self.shared.store.state()
    }

    /// Number of requests waiting for the next flush.
    pub fn pending_count(&self) -> usize {
        self.shared.store.len()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The runtime settings this batcher was created with.
    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }
}

/// Flushes on every tick until the batcher leaves `Running` or is dropped.
///
/// One interval lives for the whole loop; it is never recreated per tick.
async fn run_flush_loop<P, I>(
    shared: Arc<Shared<P, I>>,
    period: Duration,
    mut shutdown: watch::Receiver<BatcherState>,
) where
    P: Send + Sync + 'static,
    I: UpstreamInvoker<P>,
{
    // `interval` panics on a zero period.
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.flush().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() != BatcherState::Running {
                    break;
                }
            }
        }
    }

    debug!("flush loop stopped");
}

/// Second half of [`Batcher::close`]: joins the flush loop, drains the store,
/// waits out passes already delivering, then publishes `Closed`.
async fn drain_and_close<P, I>(
    shared: Arc<Shared<P, I>>,
    phase: Arc<watch::Sender<BatcherState>>,
    flush_task: Option<JoinHandle<()>>,
) where
    P: Send + Sync + 'static,
    I: UpstreamInvoker<P>,
{
    if let Some(task) = flush_task {
        if let Err(err) = task.await {
            warn!(error = %err, "flush loop terminated abnormally");
        }
    }

    let report = shared.flush().await;
    shared.wait_for_flushes().await;
    shared.store.finish_close();
    phase.send_replace(BatcherState::Closed);
    info!(drained = report.requests, "batcher closed");
}
