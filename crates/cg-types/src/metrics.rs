use serde::{Deserialize, Serialize};

/// Point-in-time copy of an endpoint's counters and gauges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub throttle_hits: u64,
    pub circuit_rejections: u64,
    pub circuit_trips: u64,
    pub retry_attempts: u64,
    pub retry_exhaustions: u64,
    pub cleared_requests: u64,
    pub queue_high_water_mark: u64,
    pub average_wait_time_ms: f64,
    #[serde(default)]
    pub queue_length: usize,
    #[serde(default)]
    pub is_processing: bool,
}

impl MetricsSnapshot {
    /// Fraction of settled requests that succeeded, or `None` before any settled.
    pub fn success_rate(&self) -> Option<f64> {
        let settled = self.successful_requests + self.failed_requests;
        if settled == 0 {
            None
        } else {
            Some(self.successful_requests as f64 / settled as f64)
        }
    }
}
