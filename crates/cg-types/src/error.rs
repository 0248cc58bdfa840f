use std::time::Duration;

use thiserror::Error;

/// HTTP status the provider uses to signal rate limiting.
pub const THROTTLE_STATUS: u16 = 429;

/// Failure reported by the collaborator that performs the remote HTTP call.
///
/// This is a closed set: the queue and breaker only ever match on these
/// variants and never inspect payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Throttled by provider (status {status})")]
    Throttled {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("Provider returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl CallError {
    /// Classify a raw HTTP status into a call error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if status == THROTTLE_STATUS {
            Self::Throttled {
                status,
                retry_after: None,
            }
        } else {
            Self::Status {
                status,
                message: message.into(),
            }
        }
    }

    /// A throttle signal carrying the provider's `Retry-After` hint.
    pub fn throttled_for(retry_after: Duration) -> Self {
        Self::Throttled {
            status: THROTTLE_STATUS,
            retry_after: Some(retry_after),
        }
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// HTTP-status-like code, if the failure had one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Throttled { status, .. } | Self::Status { status, .. } => Some(*status),
            Self::Transport(_) | Self::Timeout(_) => None,
        }
    }
}

/// Top-level error type for the resilience layer.
#[derive(Error, Debug)]
pub enum CallGuardError {
    #[error("Circuit breaker open: retry after {}ms ({failure_count} consecutive failures)", .retry_after.as_millis())]
    CircuitOpen {
        retry_after: Duration,
        failure_count: u32,
    },

    #[error("Throttle retries exhausted after {attempts} attempts (status {status})")]
    ThrottleExhausted { attempts: u32, status: u16 },

    #[error("Request queue cleared before execution")]
    QueueCleared,

    #[error("Request dropped before it was settled")]
    QueueClosed,

    #[error("Operation failed: {0}")]
    Operation(#[from] CallError),

    #[error("In-flight retry table: {0}")]
    InFlight(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CallGuardError {
    /// Whether a higher-level retry policy may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::QueueCleared | Self::QueueClosed | Self::InFlight(_) | Self::Config(_)
        )
    }

    /// Backoff hint for callers rejected by an open breaker.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Self::Operation(CallError::Throttled { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }

    /// HTTP-status-like code carried by the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Operation(e) => e.status(),
            Self::ThrottleExhausted { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Stable short name used in audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ThrottleExhausted { .. } => "throttle_exhausted",
            Self::QueueCleared => "queue_cleared",
            Self::QueueClosed => "queue_closed",
            Self::Operation(CallError::Throttled { .. }) => "throttled",
            Self::Operation(_) => "operation",
            Self::InFlight(_) => "in_flight",
            Self::Config(_) => "config",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

/// Convenience type alias.
pub type Result<T> = std::result::Result<T, CallGuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_status_recognizes_throttle() {
        let err = CallError::from_status(429, "slow down");
        assert!(err.is_throttle());
        assert_eq!(err.status(), Some(429));

        let err = CallError::from_status(503, "unavailable");
        assert!(!err.is_throttle());
        assert_eq!(
            err,
            CallError::Status {
                status: 503,
                message: "unavailable".to_string()
            }
        );
    }

    #[test]
    fn transport_errors_have_no_status() {
        assert_eq!(CallError::Transport("reset".into()).status(), None);
        assert_eq!(CallError::Timeout("30s".into()).status(), None);
    }

    #[test]
    fn circuit_open_display_and_hint() {
        let err = CallGuardError::CircuitOpen {
            retry_after: Duration::from_millis(1500),
            failure_count: 5,
        };
        assert_eq!(
            err.to_string(),
            "Circuit breaker open: retry after 1500ms (5 consecutive failures)"
        );
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert!(err.is_retryable());
    }

    #[test]
    fn cleared_is_not_retryable() {
        assert!(!CallGuardError::QueueCleared.is_retryable());
        assert!(!CallGuardError::QueueClosed.is_retryable());
        assert!(CallGuardError::ThrottleExhausted {
            attempts: 4,
            status: 429
        }
        .is_retryable());
    }

    #[test]
    fn operation_error_from_call_error() {
        let err: CallGuardError = CallError::from_status(500, "boom").into();
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.kind(), "operation");
        assert_eq!(err.to_string(), "Operation failed: Provider returned status 500: boom");

        let err: CallGuardError = CallError::throttled_for(Duration::from_secs(2)).into();
        assert_eq!(err.kind(), "throttled");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CallGuardError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }
}
