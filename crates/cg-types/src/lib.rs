pub mod audit;
pub mod breaker;
pub mod enums;
pub mod error;
pub mod metrics;
pub mod retry;

// Re-exports for convenience
pub use audit::{AuditEntry, Incident, IncidentReport};
pub use breaker::{BreakerSnapshot, FailureRecord};
pub use enums::{AttemptOutcome, CircuitState, IncidentStatus, Severity};
pub use error::{CallError, CallGuardError, Result};
pub use metrics::MetricsSnapshot;
pub use retry::{InFlightEntry, RequestId, RetryAttemptRecord};
