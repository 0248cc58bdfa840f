use std::time::Duration;

use tokio::time::Instant;

/// Minimum-interval gate for a single dispatcher.
///
/// Unlike a sliding window, the gate only remembers the last dispatch, so
/// two consecutive reservations are always at least `min_interval` apart.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last_request_at: Option<Instant>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request_at: None,
        }
    }

    /// Claim the next dispatch slot at or after `now`.
    ///
    /// Returns how long the caller must wait before dispatching.
    pub fn reserve(&mut self, now: Instant) -> Duration {
        let wait = match self.last_request_at {
            Some(last) => (last + self.min_interval).saturating_duration_since(now),
            None => Duration::ZERO,
        };
        self.last_request_at = Some(now + wait);
        wait
    }
}
