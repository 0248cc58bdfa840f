use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enums::AttemptOutcome;

/// Opaque identifier of one logical retried operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One attempt of a retried operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttemptRecord {
    /// 1-indexed.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RetryAttemptRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Row of the in-flight retry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightEntry {
    pub request_id: RequestId,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
}
