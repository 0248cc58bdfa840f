use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cg_types::MetricsSnapshot;

/// Counters and gauges shared by the breaker, queue and retry orchestrator
/// of one endpoint. Each event is recorded only by the component that owns it.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    throttle_hits: AtomicU64,
    circuit_rejections: AtomicU64,
    circuit_trips: AtomicU64,
    retry_attempts: AtomicU64,
    retry_exhaustions: AtomicU64,
    cleared_requests: AtomicU64,
    queue_high_water_mark: AtomicU64,
    wait_time_total_us: AtomicU64,
    wait_samples: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self, queue_length: usize) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.queue_high_water_mark
            .fetch_max(queue_length as u64, Ordering::Relaxed);
    }

    /// A settled success, with the time the item spent queued.
    pub fn record_success(&self, waited: Duration) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.wait_time_total_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        self.wait_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle(&self) {
        self.throttle_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_trip(&self) {
        self.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_attempt(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_exhausted(&self) {
        self.retry_exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleared(&self, count: usize) {
        self.cleared_requests
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Running mean of queue wait time over settled successes.
    pub fn average_wait_time_ms(&self) -> f64 {
        let samples = self.wait_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        let total_us = self.wait_time_total_us.load(Ordering::Relaxed);
        total_us as f64 / samples as f64 / 1000.0
    }

    /// Copy the counters. Queue gauges are filled in by the queue.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            throttle_hits: self.throttle_hits.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            retry_exhaustions: self.retry_exhaustions.load(Ordering::Relaxed),
            cleared_requests: self.cleared_requests.load(Ordering::Relaxed),
            queue_high_water_mark: self.queue_high_water_mark.load(Ordering::Relaxed),
            average_wait_time_ms: self.average_wait_time_ms(),
            queue_length: 0,
            is_processing: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let m = MetricsCollector::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn high_water_mark_only_grows() {
        let m = MetricsCollector::new();
        m.record_enqueued(3);
        m.record_enqueued(1);
        m.record_enqueued(2);
        let snap = m.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.queue_high_water_mark, 3);
    }

    #[test]
    fn average_wait_time() {
        let m = MetricsCollector::new();
        m.record_success(Duration::from_millis(100));
        m.record_success(Duration::from_millis(300));
        m.record_failure();
        let snap = m.snapshot();
        assert_eq!(snap.successful_requests, 2);
        assert_eq!(snap.failed_requests, 1);
        assert!((snap.average_wait_time_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counters_accumulate() {
        let m = MetricsCollector::new();
        m.record_throttle();
        m.record_throttle();
        m.record_circuit_rejection();
        m.record_circuit_trip();
        m.record_retry_attempt();
        m.record_retry_exhausted();
        m.record_cleared(3);
        let snap = m.snapshot();
        assert_eq!(snap.throttle_hits, 2);
        assert_eq!(snap.circuit_rejections, 1);
        assert_eq!(snap.circuit_trips, 1);
        assert_eq!(snap.retry_attempts, 1);
        assert_eq!(snap.retry_exhaustions, 1);
        assert_eq!(snap.cleared_requests, 3);
    }
}
