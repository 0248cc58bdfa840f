use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use cg_config::{Config, RetryOptions};
use cg_types::{BreakerSnapshot, CallError, InFlightEntry, MetricsSnapshot, RequestId, Result};

use crate::metrics::MetricsCollector;
use crate::resilience::{
    CircuitBreaker, InFlightRetries, OnError, PriorityRequestQueue, QueuedCall, RetryOrchestrator,
    RetryOutcome,
};
use crate::sinks::Observers;

/// One protected remote endpoint: a breaker, a queue draining through it,
/// a retry orchestrator on top, and the table of retries in progress.
///
/// Each endpoint owns its own state; nothing is shared between endpoints
/// except the observers they were built with.
pub struct ProtectedEndpoint {
    name: String,
    breaker: Arc<CircuitBreaker>,
    queue: PriorityRequestQueue,
    retry: RetryOrchestrator,
    in_flight: InFlightRetries,
}

impl ProtectedEndpoint {
    /// Fails if the queue settings in `config` are unusable.
    pub fn new(
        name: impl Into<String>,
        config: &Config,
        observers: Observers,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let metrics = Arc::new(MetricsCollector::new());
        let breaker = Arc::new(CircuitBreaker::new(
            name.clone(),
            config.breaker.clone(),
            observers.clone(),
            Arc::clone(&metrics),
        ));
        let queue = PriorityRequestQueue::with_breaker(
            Arc::clone(&breaker),
            config.queue.clone(),
            observers.clone(),
            Arc::clone(&metrics),
        )?;
        let retry = RetryOrchestrator::new(
            name.clone(),
            config.retry.clone(),
            observers,
            metrics,
        );

        info!(
            endpoint = %name,
            requests_per_second = config.queue.requests_per_second,
            failure_threshold = config.breaker.failure_threshold,
            max_attempts = config.retry.max_attempts,
            "Protected endpoint ready"
        );

        Ok(Arc::new(Self {
            name,
            breaker,
            queue,
            retry,
            in_flight: InFlightRetries::new(config.max_in_flight_retries),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit one call through the queue and breaker, without retries.
    pub fn enqueue<T, F, Fut>(&self, operation: F, priority: i32) -> QueuedCall<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, CallError>> + Send + 'static,
    {
        self.queue.enqueue(operation, priority)
    }

    /// Run a call through the queue and breaker, retrying the whole path on failure.
    ///
    /// `request_id` must be unique among the endpoint's in-flight retries;
    /// a duplicate is rejected before the first attempt.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        request_id: RequestId,
        priority: i32,
        operation: F,
        options: Option<RetryOptions>,
        on_error: Option<OnError>,
    ) -> RetryOutcome<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Clone + Send + 'static,
        Fut: Future<Output = std::result::Result<T, CallError>> + Send + 'static,
    {
        let guard = match self.in_flight.begin(request_id.clone()) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(endpoint = %self.name, request_id = %request_id, error = %e, "Retry refused");
                return RetryOutcome::rejected(e);
            }
        };

        let guard = &guard;
        let queue = &self.queue;
        self.retry
            .retry_if_fail(&request_id, options.as_ref(), on_error, move |attempt| {
                guard.set_attempts(attempt + 1);
                queue.enqueue(operation.clone(), priority)
            })
            .await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.queue.get_metrics()
    }

    pub async fn breaker_state(&self) -> BreakerSnapshot {
        self.breaker.get_state().await
    }

    pub async fn reset_breaker(&self) {
        self.breaker.reset().await;
    }

    pub async fn force_open(&self, reason: &str) {
        self.breaker.force_open(reason).await;
    }

    /// Reject all queued calls. Returns how many were rejected.
    pub async fn clear(&self) -> usize {
        self.queue.clear().await
    }

    pub fn in_flight(&self) -> Vec<InFlightEntry> {
        self.in_flight.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::testing::Recorder;
    use cg_types::{CallGuardError, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn endpoint(recorder: &Arc<Recorder>) -> Arc<ProtectedEndpoint> {
        ProtectedEndpoint::new("crm", &Config::default(), recorder.observers()).unwrap()
    }

    type Reply = std::future::Ready<std::result::Result<u32, CallError>>;

    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl FnMut() -> Reply + Clone + Send + 'static {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < failures {
                Err(CallError::from_status(503, "unavailable"))
            } else {
                Ok(n)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_rate_is_rejected() {
        let mut config = Config::default();
        config.queue.requests_per_second = 1e-20;
        let built = ProtectedEndpoint::new("crm", &config, Observers::default());
        assert!(matches!(built, Err(CallGuardError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_through_queue_until_success() {
        let recorder = Arc::new(Recorder::default());
        let ep = endpoint(&recorder);
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = ep
            .execute_with_retry(
                RequestId::from("contact-7"),
                0,
                flaky(2, Arc::clone(&calls)),
                None,
                None,
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result, Some(2));
        assert!(ep.in_flight().is_empty());

        let metrics = ep.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.retry_attempts, 3);
        assert_eq!(ep.breaker_state().await.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_request_id_is_refused() {
        let recorder = Arc::new(Recorder::default());
        let ep = endpoint(&recorder);
        let calls = Arc::new(AtomicU32::new(0));

        let first = {
            let ep = Arc::clone(&ep);
            let op = flaky(1, Arc::clone(&calls));
            tokio::spawn(async move {
                ep.execute_with_retry(RequestId::from("dup"), 0, op, None, None)
                    .await
                    .success
            })
        };
        tokio::task::yield_now().await;

        let entries = ep.in_flight();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request_id.as_str(), "dup");

        let second = ep
            .execute_with_retry(
                RequestId::from("dup"),
                0,
                flaky(0, Arc::clone(&calls)),
                None,
                None,
            )
            .await;
        assert!(!second.success);
        assert_eq!(second.attempts, 0);
        assert!(matches!(second.error, Some(CallGuardError::InFlight(_))));

        assert!(first.await.unwrap());
        assert!(ep.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_failure_trips_breaker_and_escalates() {
        let recorder = Arc::new(Recorder::default());
        let ep = endpoint(&recorder);
        let calls = Arc::new(AtomicU32::new(0));

        for i in 0..2 {
            let outcome = ep
                .execute_with_retry(
                    RequestId::from(format!("batch-{i}")),
                    0,
                    flaky(u32::MAX, Arc::clone(&calls)),
                    Some(RetryOptions {
                        max_attempts: 3,
                        base_delay_ms: 10,
                        max_delay_ms: 100,
                    }),
                    None,
                )
                .await;
            assert!(!outcome.success);
        }

        // Five failures opened the breaker; the sixth attempt never reached the provider
        let state = ep.breaker_state().await;
        assert_eq!(state.state, CircuitState::Open);
        assert!(calls.load(Ordering::SeqCst) >= 5);
        assert!(ep.metrics().circuit_rejections >= 1);

        let titles = recorder.incident_titles();
        assert!(titles.contains(&"Circuit breaker opened for crm".to_string()));
        assert!(titles.contains(&"Retry exhausted for crm request batch-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn operator_controls() {
        let recorder = Arc::new(Recorder::default());
        let ep = endpoint(&recorder);

        ep.force_open("maintenance window").await;
        let err = ep
            .enqueue(|| async { Ok::<_, CallError>(()) }, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CallGuardError::CircuitOpen { .. }));

        ep.reset_breaker().await;
        let value = ep
            .enqueue(|| async { Ok::<_, CallError>(5) }, 0)
            .await
            .unwrap();
        assert_eq!(value, 5);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ep.clear().await, 0);
        assert_eq!(ep.name(), "crm");
    }
}
