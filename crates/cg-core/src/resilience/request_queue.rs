use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use cg_config::QueueConfig;
use cg_types::{CallError, CallGuardError, MetricsSnapshot, Result};

use crate::metrics::MetricsCollector;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::rate_gate::RateGate;
use crate::sinks::Observers;

const COMPONENT: &str = "queue";

type AttemptFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Type-erased unit of work owned by the queue.
trait Job: Send {
    /// Run the operation once, keeping its output until the item settles.
    fn attempt<'a>(&'a mut self, breaker: Option<&'a CircuitBreaker>) -> AttemptFuture<'a>;

    fn complete(self: Box<Self>);

    fn fail(self: Box<Self>, error: CallGuardError);
}

struct TypedJob<T, F> {
    operation: F,
    output: Option<T>,
    reply: oneshot::Sender<Result<T>>,
}

impl<T, F, Fut> Job for TypedJob<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, CallError>> + Send + 'static,
{
    fn attempt<'a>(&'a mut self, breaker: Option<&'a CircuitBreaker>) -> AttemptFuture<'a> {
        Box::pin(async move {
            let value = match breaker {
                Some(breaker) => breaker.execute(|| (self.operation)()).await?,
                None => (self.operation)().await?,
            };
            self.output = Some(value);
            Ok::<_, CallGuardError>(())
        })
    }

    fn complete(self: Box<Self>) {
        let this = *self;
        let result = this
            .output
            .ok_or_else(|| CallGuardError::Other("Completed without output".into()));
        // The caller may have stopped waiting
        let _ = this.reply.send(result);
    }

    fn fail(self: Box<Self>, error: CallGuardError) {
        let _ = self.reply.send(Err(error));
    }
}

/// A pending unit of work.
struct QueueItem {
    job: Box<dyn Job>,
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    retry_count: u32,
    /// Set while a throttled item sits out its backoff in the requeue lane.
    not_before: Option<Instant>,
}

// Heap order: higher priority first, then lower sequence number.
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueItem {}

#[derive(Default)]
struct Pending {
    heap: BinaryHeap<QueueItem>,
    /// Throttled items waiting to go out again. Drained before the heap.
    requeued: VecDeque<QueueItem>,
    next_seq: u64,
}

impl Pending {
    fn len(&self) -> usize {
        self.heap.len() + self.requeued.len()
    }

    /// Take the next item due at `now`, or report how long the lane head
    /// still has to back off.
    fn next(&mut self, now: Instant) -> Next {
        if let Some(ready_at) = self.requeued.front().and_then(|item| item.not_before) {
            if ready_at > now {
                return Next::Backoff(ready_at);
            }
        }
        match self.requeued.pop_front().or_else(|| self.heap.pop()) {
            Some(item) => Next::Dispatch(item),
            None => Next::Drained,
        }
    }
}

enum Next {
    Dispatch(QueueItem),
    Backoff(Instant),
    Drained,
}

struct QueueShared {
    endpoint: String,
    config: QueueConfig,
    pending: Mutex<Pending>,
    processing: AtomicBool,
    gate: Mutex<RateGate>,
    breaker: Option<Arc<CircuitBreaker>>,
    observers: Observers,
    metrics: Arc<MetricsCollector>,
}

/// Rate-limited priority queue draining through a single worker task.
///
/// Items run one at a time, highest priority first and FIFO within a
/// priority, never closer together than `1 / requests_per_second`. A
/// throttled item is retried with its own backoff and goes back out ahead
/// of everything else, at most `max_throttle_retries` times.
///
/// Must be used from within a tokio runtime: the worker is spawned lazily
/// by the first `enqueue` on an idle queue and exits once the queue drains.
#[derive(Clone)]
pub struct PriorityRequestQueue {
    shared: Arc<QueueShared>,
}

impl PriorityRequestQueue {
    /// A standalone queue that calls operations directly.
    ///
    /// Fails if `config.requests_per_second` does not give a usable interval.
    pub fn new(
        endpoint: impl Into<String>,
        config: QueueConfig,
        observers: Observers,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        Self::build(endpoint.into(), config, None, observers, metrics)
    }

    /// A queue whose worker runs every operation through `breaker`.
    pub fn with_breaker(
        breaker: Arc<CircuitBreaker>,
        config: QueueConfig,
        observers: Observers,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let endpoint = breaker.endpoint().to_string();
        Self::build(endpoint, config, Some(breaker), observers, metrics)
    }

    fn build(
        endpoint: String,
        config: QueueConfig,
        breaker: Option<Arc<CircuitBreaker>>,
        observers: Observers,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let gate = RateGate::new(config.min_interval()?);
        Ok(Self {
            shared: Arc::new(QueueShared {
                endpoint,
                config,
                pending: Mutex::new(Pending::default()),
                processing: AtomicBool::new(false),
                gate: Mutex::new(gate),
                breaker,
                observers,
                metrics,
            }),
        })
    }

    /// Submit an operation. The returned future resolves once the item settles.
    ///
    /// The operation may be invoked more than once if the provider throttles it.
    pub fn enqueue<T, F, Fut>(&self, operation: F, priority: i32) -> QueuedCall<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, CallError>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job = Box::new(TypedJob {
            operation,
            output: None,
            reply,
        });

        let queue_length = {
            let mut pending = self.shared.lock_pending();
            let seq = pending.next_seq;
            pending.next_seq += 1;
            pending.heap.push(QueueItem {
                job,
                priority,
                seq,
                enqueued_at: Instant::now(),
                retry_count: 0,
                not_before: None,
            });
            pending.len()
        };

        self.shared.metrics.record_enqueued(queue_length);
        debug!(
            endpoint = %self.shared.endpoint,
            priority, queue_length, "Request enqueued"
        );

        self.ensure_worker();
        QueuedCall { rx }
    }

    fn ensure_worker(&self) {
        if self
            .shared
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.run().await;
            });
        }
    }

    /// Reject every item not yet dequeued, including throttled items still
    /// backing off. Items already running are unaffected.
    pub async fn clear(&self) -> usize {
        let drained: Vec<QueueItem> = {
            let mut guard = self.shared.lock_pending();
            let pending = &mut *guard;
            pending
                .requeued
                .drain(..)
                .chain(pending.heap.drain())
                .collect()
        };

        let count = drained.len();
        for item in drained {
            item.job.fail(CallGuardError::QueueCleared);
        }

        self.shared.metrics.record_cleared(count);
        info!(endpoint = %self.shared.endpoint, count, "Request queue cleared");
        self.shared
            .observers
            .emit(
                COMPONENT,
                "cleared",
                json!({ "endpoint": self.shared.endpoint, "count": count }),
            )
            .await;
        count
    }

    /// Counters plus current queue length and worker status.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.shared.metrics.snapshot();
        snapshot.queue_length = self.len();
        snapshot.is_processing = self.is_processing();
        snapshot
    }

    pub fn len(&self) -> usize {
        self.shared.lock_pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self) -> bool {
        self.shared.processing.load(Ordering::Acquire)
    }
}

impl QueueShared {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>) {
        let _guard = WorkerGuard {
            processing: &self.processing,
        };

        loop {
            let next = {
                let mut pending = self.lock_pending();
                let next = pending.next(Instant::now());
                if let Next::Drained = next {
                    // Cleared under the lock so a concurrent enqueue either
                    // sees a live worker or starts a new one
                    self.processing.store(false, Ordering::Release);
                    debug!(endpoint = %self.endpoint, "Queue drained, worker exiting");
                }
                next
            };
            match next {
                Next::Dispatch(item) => self.dispatch(item).await,
                // The lane head may be cleared meanwhile; re-check on wake
                Next::Backoff(ready_at) => tokio::time::sleep_until(ready_at).await,
                Next::Drained => return,
            }
        }
    }

    async fn dispatch(&self, mut item: QueueItem) {
        let wait = self
            .gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reserve(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let waited = item.enqueued_at.elapsed();

        let outcome = item.job.attempt(self.breaker.as_deref()).await;
        match outcome {
            Ok(()) => {
                self.metrics.record_success(waited);
                item.job.complete();
            }
            Err(CallGuardError::Operation(CallError::Throttled {
                status,
                retry_after,
            })) => {
                self.metrics.record_throttle();
                if item.retry_count < self.config.max_throttle_retries {
                    item.retry_count += 1;
                    let computed = self.config.throttle_delay(item.retry_count);
                    let delay = retry_after.map_or(computed, |hint| hint.max(computed));
                    let (retry_count, priority) = (item.retry_count, item.priority);
                    item.not_before = Some(Instant::now() + delay);
                    self.lock_pending().requeued.push_front(item);

                    warn!(
                        endpoint = %self.endpoint,
                        retry = retry_count,
                        max = self.config.max_throttle_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Throttled by provider, requeueing"
                    );
                    self.observers
                        .emit(
                            COMPONENT,
                            "throttled_requeue",
                            json!({
                                "endpoint": self.endpoint,
                                "retry_count": retry_count,
                                "delay_ms": delay.as_millis() as u64,
                                "priority": priority,
                            }),
                        )
                        .await;
                } else {
                    let attempts = item.retry_count + 1;
                    self.metrics.record_failure();
                    error!(
                        endpoint = %self.endpoint,
                        attempts, "Throttle retries exhausted"
                    );
                    self.observers
                        .emit(
                            COMPONENT,
                            "throttle_exhausted",
                            json!({
                                "endpoint": self.endpoint,
                                "attempts": attempts,
                                "status": status,
                            }),
                        )
                        .await;
                    item.job
                        .fail(CallGuardError::ThrottleExhausted { attempts, status });
                }
            }
            Err(e) => {
                self.metrics.record_failure();
                debug!(endpoint = %self.endpoint, error = %e, "Request failed");
                item.job.fail(e);
            }
        }
    }
}

/// Releases the processing flag if the worker unwinds.
struct WorkerGuard<'a> {
    processing: &'a AtomicBool,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.processing.store(false, Ordering::Release);
        }
    }
}

/// Handle to a queued request's eventual result.
///
/// Resolves with [`CallGuardError::QueueClosed`] if the worker dropped the
/// item without settling it.
#[must_use = "a queued call does nothing unless awaited"]
pub struct QueuedCall<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future for QueuedCall<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(CallGuardError::QueueClosed)))
    }
}
