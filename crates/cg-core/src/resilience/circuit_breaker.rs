use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cg_config::BreakerConfig;
use cg_types::{
    BreakerSnapshot, CallError, CallGuardError, CircuitState, FailureRecord, IncidentReport,
    Result, Severity,
};

use crate::metrics::MetricsCollector;
use crate::sinks::Observers;

const COMPONENT: &str = "breaker";

/// Circuit breaker guarding one remote endpoint.
///
/// Tracks consecutive failures of the endpoint as a whole. After
/// `failure_threshold` failures the breaker opens and rejects calls without
/// running them until `reset_timeout` has passed; it then admits probes and
/// closes again only after `recovery_threshold` consecutive probe successes.
/// Any probe failure reopens it.
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    observers: Observers,
    metrics: Arc<MetricsCollector>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    state_since: Instant,
    opened_until: Option<Instant>,
    recent_errors: VecDeque<FailureRecord>,
}

impl BreakerInner {
    fn transition(&mut self, state: CircuitState, now: Instant) {
        self.state = state;
        self.state_since = now;
        self.probe_successes = 0;
    }
}

/// State change to announce once the lock is released.
enum Transition {
    HalfOpen,
    Closed,
    Opened { failures: u32, error: String },
    Reopened { error: String },
}

impl CircuitBreaker {
    pub fn new(
        endpoint: impl Into<String>,
        config: BreakerConfig,
        observers: Observers,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                state_since: Instant::now(),
                opened_until: None,
                recent_errors: VecDeque::new(),
            }),
            observers,
            metrics,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run `operation` if the breaker admits traffic.
    ///
    /// An open breaker fails with [`CallGuardError::CircuitOpen`] without
    /// invoking the operation. Operation failures are recorded and returned
    /// as [`CallGuardError::Operation`].
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        self.admit().await?;

        match operation().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure(&e).await;
                Err(CallGuardError::Operation(e))
            }
        }
    }

    async fn admit(&self) -> Result<()> {
        let transition = {
            let mut inner = self.inner.lock().await;
            if inner.state != CircuitState::Open {
                return Ok(());
            }
            let now = Instant::now();
            let opened_until = inner.opened_until;
            match opened_until {
                Some(until) if now < until => {
                    let retry_after = until - now;
                    let failure_count = inner.consecutive_failures;
                    drop(inner);
                    self.metrics.record_circuit_rejection();
                    debug!(
                        endpoint = %self.endpoint,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Circuit open, rejecting call"
                    );
                    return Err(CallGuardError::CircuitOpen {
                        retry_after,
                        failure_count,
                    });
                }
                _ => {
                    inner.transition(CircuitState::HalfOpen, now);
                    inner.opened_until = None;
                    Transition::HalfOpen
                }
            }
        };

        self.announce(transition).await;
        Ok(())
    }

    async fn on_success(&self) {
        let transition = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.probe_successes += 1;
                    if inner.probe_successes >= self.config.recovery_threshold {
                        inner.transition(CircuitState::Closed, Instant::now());
                        inner.consecutive_failures = 0;
                        Some(Transition::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Closed => {
                    // Old, unrelated failures decay instead of accumulating
                    inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
                    None
                }
                // Forced open while the call was running
                CircuitState::Open => None,
            }
        };

        if let Some(transition) = transition {
            self.announce(transition).await;
        }
    }

    async fn on_failure(&self, error: &CallError) {
        let transition = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();

            inner.recent_errors.push_back(FailureRecord {
                timestamp: Utc::now(),
                kind: failure_kind(error).to_string(),
                message: error.to_string(),
            });
            while inner.recent_errors.len() > self.config.error_history_size {
                inner.recent_errors.pop_front();
            }
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

            match inner.state {
                CircuitState::HalfOpen => {
                    inner.transition(CircuitState::Open, now);
                    inner.opened_until = Some(now + self.config.reset_timeout());
                    Some(Transition::Reopened {
                        error: error.to_string(),
                    })
                }
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    inner.transition(CircuitState::Open, now);
                    inner.opened_until = Some(now + self.config.reset_timeout());
                    Some(Transition::Opened {
                        failures: inner.consecutive_failures,
                        error: error.to_string(),
                    })
                }
                _ => None,
            }
        };

        if let Some(transition) = transition {
            self.announce(transition).await;
        }
    }

    async fn announce(&self, transition: Transition) {
        let endpoint = self.endpoint.as_str();
        let reset_timeout_ms = self.config.reset_timeout_ms;
        match transition {
            Transition::HalfOpen => {
                info!(endpoint, "Circuit breaker entering HALF_OPEN state");
                self.observers
                    .emit(COMPONENT, "half_open", json!({ "endpoint": endpoint }))
                    .await;
            }
            Transition::Closed => {
                info!(
                    endpoint,
                    probes = self.config.recovery_threshold,
                    "Circuit breaker closed after successful probes"
                );
                self.observers
                    .emit(COMPONENT, "closed", json!({ "endpoint": endpoint }))
                    .await;
            }
            Transition::Opened { failures, error } => {
                warn!(
                    endpoint,
                    failures, reset_timeout_ms, "Circuit breaker opening"
                );
                self.metrics.record_circuit_trip();
                self.observers
                    .emit(
                        COMPONENT,
                        "opened",
                        json!({
                            "endpoint": endpoint,
                            "failures": failures,
                            "reset_timeout_ms": reset_timeout_ms,
                            "error": error,
                        }),
                    )
                    .await;
                self.observers
                    .escalate(IncidentReport {
                        severity: Severity::High,
                        title: format!("Circuit breaker opened for {endpoint}"),
                        error_message: error,
                        metadata: json!({
                            "endpoint": endpoint,
                            "failures": failures,
                            "reset_timeout_ms": reset_timeout_ms,
                        }),
                    })
                    .await;
            }
            Transition::Reopened { error } => {
                warn!(endpoint, error = %error, "Probe failed, circuit breaker reopening");
                self.observers
                    .emit(
                        COMPONENT,
                        "reopened",
                        json!({
                            "endpoint": endpoint,
                            "reset_timeout_ms": reset_timeout_ms,
                            "error": error,
                        }),
                    )
                    .await;
            }
        }
    }

    /// Read-only snapshot for observability.
    pub async fn get_state(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let next_attempt_at = match (inner.state, inner.opened_until) {
            (CircuitState::Open, Some(until)) => {
                let remaining = until.saturating_duration_since(now);
                chrono::Duration::from_std(remaining)
                    .ok()
                    .map(|d| Utc::now() + d)
            }
            _ => None,
        };

        BreakerSnapshot {
            endpoint: self.endpoint.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            probe_successes: inner.probe_successes,
            time_in_state_ms: now.saturating_duration_since(inner.state_since).as_millis() as u64,
            next_attempt_at,
            recent_errors: inner.recent_errors.iter().cloned().collect(),
        }
    }

    /// Force CLOSED, zero the counters and forget recent errors.
    pub async fn reset(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.transition(CircuitState::Closed, Instant::now());
            inner.consecutive_failures = 0;
            inner.opened_until = None;
            inner.recent_errors.clear();
        }
        info!(endpoint = %self.endpoint, "Circuit breaker reset by operator");
        self.observers
            .emit(COMPONENT, "reset", json!({ "endpoint": self.endpoint }))
            .await;
    }

    /// Force OPEN for one reset timeout.
    pub async fn force_open(&self, reason: &str) {
        let until = {
            let mut inner = self.inner.lock().await;
            let now = Instant::now();
            inner.transition(CircuitState::Open, now);
            let until = now + self.config.reset_timeout();
            inner.opened_until = Some(until);
            until
        };
        warn!(endpoint = %self.endpoint, reason, "Circuit breaker forced open");
        self.observers
            .emit(
                COMPONENT,
                "forced_open",
                json!({
                    "endpoint": self.endpoint,
                    "reason": reason,
                    "open_for_ms": until.saturating_duration_since(Instant::now()).as_millis() as u64,
                }),
            )
            .await;
    }

    /// Remaining time before an open breaker admits a probe.
    pub async fn retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        match (inner.state, inner.opened_until) {
            (CircuitState::Open, Some(until)) => Some(until.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }
}

fn failure_kind(error: &CallError) -> &'static str {
    match error {
        CallError::Throttled { .. } => "throttled",
        CallError::Status { .. } => "status",
        CallError::Transport(_) => "transport",
        CallError::Timeout(_) => "timeout",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::testing::Recorder;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker_with(recorder: &Arc<Recorder>) -> (CircuitBreaker, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let breaker = CircuitBreaker::new(
            "crm",
            BreakerConfig::default(),
            recorder.observers(),
            Arc::clone(&metrics),
        );
        (breaker, metrics)
    }

    async fn fail(cb: &CircuitBreaker) -> CallGuardError {
        cb.execute(|| async { Err::<(), _>(CallError::from_status(500, "boom")) })
            .await
            .unwrap_err()
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<i32> {
        cb.execute(|| async { Ok::<_, CallError>(42) }).await
    }

    async fn trip(cb: &CircuitBreaker) {
        for _ in 0..5 {
            fail(cb).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn starts_closed() {
        let recorder = Arc::new(Recorder::default());
        let (cb, _) = breaker_with(&recorder);
        let state = cb.get_state().await;
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.next_attempt_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn success_passes_value_through() {
        let recorder = Arc::new(Recorder::default());
        let (cb, _) = breaker_with(&recorder);
        assert_eq!(succeed(&cb).await.unwrap(), 42);
        assert_eq!(cb.get_state().await.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_without_invoking() {
        let recorder = Arc::new(Recorder::default());
        let (cb, metrics) = breaker_with(&recorder);

        for _ in 0..4 {
            let err = fail(&cb).await;
            assert!(matches!(err, CallGuardError::Operation(_)));
        }
        assert_eq!(cb.get_state().await.state, CircuitState::Closed);

        fail(&cb).await;
        let state = cb.get_state().await;
        assert_eq!(state.state, CircuitState::Open);
        assert!(state.next_attempt_at.is_some());

        let calls = AtomicU32::new(0);
        let err = cb
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CallError>(()) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match err {
            CallGuardError::CircuitOpen {
                retry_after,
                failure_count,
            } => {
                assert_eq!(failure_count, 5);
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(59));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.circuit_trips, 1);
        assert_eq!(snap.circuit_rejections, 1);
        assert_eq!(recorder.events(COMPONENT), vec!["opened"]);
        assert_eq!(recorder.incident_titles(), vec!["Circuit breaker opened for crm"]);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probes_close_after_recovery_threshold() {
        let recorder = Arc::new(Recorder::default());
        let (cb, _) = breaker_with(&recorder);
        trip(&cb).await;

        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(succeed(&cb).await.unwrap(), 42);
        let state = cb.get_state().await;
        assert_eq!(state.state, CircuitState::HalfOpen);
        assert_eq!(state.probe_successes, 1);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.get_state().await.state, CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        let state = cb.get_state().await;
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);

        assert_eq!(
            recorder.events(COMPONENT),
            vec!["opened", "half_open", "closed"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_fresh_timeout() {
        let recorder = Arc::new(Recorder::default());
        let (cb, metrics) = breaker_with(&recorder);
        trip(&cb).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        succeed(&cb).await.unwrap();
        fail(&cb).await;

        let state = cb.get_state().await;
        assert_eq!(state.state, CircuitState::Open);
        let retry_after = cb.retry_after().await.unwrap();
        assert_eq!(retry_after, Duration::from_secs(60));

        // A reopen is not a new trip
        assert_eq!(metrics.snapshot().circuit_trips, 1);
        assert_eq!(recorder.incident_titles().len(), 1);
        assert_eq!(
            recorder.events(COMPONENT),
            vec!["opened", "half_open", "reopened"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closed_success_decays_failures() {
        let recorder = Arc::new(Recorder::default());
        let (cb, _) = breaker_with(&recorder);

        for _ in 0..4 {
            fail(&cb).await;
        }
        succeed(&cb).await.unwrap();
        assert_eq!(cb.get_state().await.consecutive_failures, 3);

        // One more failure brings it back to 4, still below threshold
        fail(&cb).await;
        assert_eq!(cb.get_state().await.state, CircuitState::Closed);
        fail(&cb).await;
        assert_eq!(cb.get_state().await.state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_errors_ring_is_bounded() {
        let recorder = Arc::new(Recorder::default());
        let metrics = Arc::new(MetricsCollector::new());
        let config = BreakerConfig {
            failure_threshold: 100,
            error_history_size: 3,
            ..BreakerConfig::default()
        };
        let cb = CircuitBreaker::new("crm", config, recorder.observers(), metrics);

        for status in [500, 502, 503, 504] {
            let _ = cb
                .execute(|| async move { Err::<(), _>(CallError::from_status(status, "down")) })
                .await;
        }
        let state = cb.get_state().await;
        assert_eq!(state.recent_errors.len(), 3);
        assert!(state.recent_errors[0].message.contains("502"));
        assert!(state.recent_errors[2].message.contains("504"));
        assert_eq!(state.recent_errors[0].kind, "status");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_and_force_open() {
        let recorder = Arc::new(Recorder::default());
        let (cb, _) = breaker_with(&recorder);
        trip(&cb).await;

        cb.reset().await;
        let state = cb.get_state().await;
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.recent_errors.is_empty());
        assert_eq!(succeed(&cb).await.unwrap(), 42);

        cb.force_open("provider maintenance").await;
        let err = succeed(&cb).await.unwrap_err();
        assert!(matches!(err, CallGuardError::CircuitOpen { .. }));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(succeed(&cb).await.unwrap(), 42);
        assert_eq!(cb.get_state().await.state, CircuitState::HalfOpen);

        assert_eq!(
            recorder.events(COMPONENT),
            vec!["opened", "reset", "forced_open", "half_open"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn get_state_does_not_transition() {
        let recorder = Arc::new(Recorder::default());
        let (cb, _) = breaker_with(&recorder);
        trip(&cb).await;
        tokio::time::advance(Duration::from_secs(120)).await;

        assert_eq!(cb.get_state().await.state, CircuitState::Open);
        assert_eq!(cb.get_state().await.time_in_state_ms, 120_000);
    }
}
