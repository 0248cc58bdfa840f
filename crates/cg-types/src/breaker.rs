use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::CircuitState;

/// A recent failure kept for diagnostics. Never consulted for control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

/// Read-only view of a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub probe_successes: u32,
    pub time_in_state_ms: u64,
    /// When an open breaker will admit its next probe.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recent_errors: Vec<FailureRecord>,
}

impl BreakerSnapshot {
    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}
