use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use cg_config::RetryOptions;
use cg_types::{
    AttemptOutcome, CallGuardError, IncidentReport, RequestId, Result, RetryAttemptRecord,
    Severity,
};

use crate::metrics::MetricsCollector;
use crate::sinks::Observers;

const COMPONENT: &str = "retry";

/// Escalation hook run once when every attempt has failed.
pub type OnError =
    Box<dyn FnOnce(&CallGuardError, &[RetryAttemptRecord]) -> Result<()> + Send>;

/// Exponential backoff with up to 25% additive jitter:
/// `min(base * 2^attempt, max) + rand[0, that / 4)`.
pub fn calculate_backoff(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    let exponential = base_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped = exponential.min(max_delay_ms);
    let jitter_range = capped / 4;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(capped + jitter)
}

/// Result of one `retry_if_fail` invocation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub success: bool,
    /// Operation invocations that counted toward the budget.
    pub attempts: u32,
    pub result: Option<T>,
    pub error: Option<CallGuardError>,
    pub records: Vec<RetryAttemptRecord>,
}

impl<T> RetryOutcome<T> {
    /// An outcome for a call that was refused before its first attempt.
    pub fn rejected(error: CallGuardError) -> Self {
        Self {
            success: false,
            attempts: 0,
            result: None,
            error: Some(error),
            records: Vec::new(),
        }
    }

    pub fn into_result(self) -> Result<T> {
        match (self.result, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(e)) => Err(e),
            (None, None) => Err(CallGuardError::Other("Retry produced no result".into())),
        }
    }
}

/// Per-call retry policy with jittered exponential backoff and escalation.
///
/// Independent of the queue's throttle handling: an orchestrated operation
/// typically goes through the queue on every attempt.
pub struct RetryOrchestrator {
    endpoint: String,
    defaults: RetryOptions,
    observers: Observers,
    metrics: Arc<MetricsCollector>,
}

impl RetryOrchestrator {
    pub fn new(
        endpoint: impl Into<String>,
        defaults: RetryOptions,
        observers: Observers,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            defaults,
            observers,
            metrics,
        }
    }

    /// Run `operation` until it succeeds or `options.max_attempts` invocations fail.
    ///
    /// The operation receives the 0-based attempt number. A
    /// [`CallGuardError::CircuitOpen`] rejection waits out the breaker's
    /// `retry_after` (capped at `max_delay_ms`) without spending an attempt,
    /// up to `max_attempts` times per call. Non-retryable errors end the
    /// call at once and are not escalated.
    pub async fn retry_if_fail<T, F, Fut>(
        &self,
        request_id: &RequestId,
        options: Option<&RetryOptions>,
        on_error: Option<OnError>,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let options = options.unwrap_or(&self.defaults);
        let max_attempts = options.max_attempts.max(1);
        let max_delay = Duration::from_millis(options.max_delay_ms);
        let mut records: Vec<RetryAttemptRecord> = Vec::new();
        let mut attempt = 0u32;
        let mut circuit_waits = 0u32;

        loop {
            let started = Instant::now();
            let timestamp = Utc::now();
            let outcome = operation(attempt).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let err = match outcome {
                Ok(value) => {
                    self.metrics.record_retry_attempt();
                    records.push(RetryAttemptRecord {
                        attempt_number: attempt + 1,
                        outcome: AttemptOutcome::Success,
                        duration_ms,
                        error_message: None,
                        timestamp,
                    });
                    if attempt > 0 {
                        info!(
                            endpoint = %self.endpoint,
                            request_id = %request_id,
                            attempt = attempt + 1,
                            "Operation succeeded after retry"
                        );
                    }
                    self.emit_attempt(request_id, records.last(), "attempt_success")
                        .await;
                    return RetryOutcome {
                        success: true,
                        attempts: attempt + 1,
                        result: Some(value),
                        error: None,
                        records,
                    };
                }
                Err(e) => e,
            };

            if let CallGuardError::CircuitOpen { retry_after, .. } = &err {
                if circuit_waits < max_attempts {
                    circuit_waits += 1;
                    let wait = (*retry_after).min(max_delay);
                    debug!(
                        endpoint = %self.endpoint,
                        request_id = %request_id,
                        wait_ms = wait.as_millis() as u64,
                        "Circuit open, waiting before next attempt"
                    );
                    self.observers
                        .emit(
                            COMPONENT,
                            "circuit_wait",
                            json!({
                                "endpoint": self.endpoint,
                                "request_id": request_id,
                                "wait_ms": wait.as_millis() as u64,
                            }),
                        )
                        .await;
                    tokio::time::sleep(wait).await;
                    continue;
                }
            }

            self.metrics.record_retry_attempt();
            records.push(RetryAttemptRecord {
                attempt_number: attempt + 1,
                outcome: AttemptOutcome::Failure,
                duration_ms,
                error_message: Some(err.to_string()),
                timestamp,
            });
            self.emit_attempt(request_id, records.last(), "attempt_failure")
                .await;

            if !err.is_retryable() {
                warn!(
                    endpoint = %self.endpoint,
                    request_id = %request_id,
                    error = %err,
                    "Non-retryable failure, giving up"
                );
                return RetryOutcome {
                    success: false,
                    attempts: attempt + 1,
                    result: None,
                    error: Some(err),
                    records,
                };
            }

            if attempt + 1 >= max_attempts {
                self.exhausted(request_id, &err, &records, on_error).await;
                return RetryOutcome {
                    success: false,
                    attempts: max_attempts,
                    result: None,
                    error: Some(err),
                    records,
                };
            }

            let delay = calculate_backoff(attempt, options.base_delay_ms, options.max_delay_ms);
            warn!(
                endpoint = %self.endpoint,
                request_id = %request_id,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn emit_attempt(
        &self,
        request_id: &RequestId,
        record: Option<&RetryAttemptRecord>,
        event: &str,
    ) {
        self.observers
            .emit(
                COMPONENT,
                event,
                json!({
                    "endpoint": self.endpoint,
                    "request_id": request_id,
                    "record": record,
                }),
            )
            .await;
    }

    async fn exhausted(
        &self,
        request_id: &RequestId,
        err: &CallGuardError,
        records: &[RetryAttemptRecord],
        on_error: Option<OnError>,
    ) {
        self.metrics.record_retry_exhausted();
        error!(
            endpoint = %self.endpoint,
            request_id = %request_id,
            attempts = records.len(),
            error = %err,
            "Retry attempts exhausted"
        );

        if let Some(hook) = on_error {
            match catch_unwind(AssertUnwindSafe(|| hook(err, records))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(request_id = %request_id, error = %e, "Escalation hook failed")
                }
                Err(_) => warn!(request_id = %request_id, "Escalation hook panicked"),
            }
        }

        self.observers
            .emit(
                COMPONENT,
                "exhausted",
                json!({
                    "endpoint": self.endpoint,
                    "request_id": request_id,
                    "attempts": records.len(),
                    "error": err.to_string(),
                }),
            )
            .await;
        self.observers
            .escalate(IncidentReport {
                severity: Severity::High,
                title: format!("Retry exhausted for {} request {request_id}", self.endpoint),
                error_message: err.to_string(),
                metadata: json!({
                    "endpoint": self.endpoint,
                    "request_id": request_id,
                    "kind": err.kind(),
                    "status": err.status(),
                    "attempts": records,
                }),
            })
            .await;
    }
}
