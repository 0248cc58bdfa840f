pub mod endpoint;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod shutdown;
pub mod sinks;

pub use endpoint::ProtectedEndpoint;
pub use logging::init_logging;
pub use metrics::MetricsCollector;
pub use resilience::{
    calculate_backoff, CircuitBreaker, InFlightGuard, InFlightRetries, OnError,
    PriorityRequestQueue, QueuedCall, RateGate, RetryOrchestrator, RetryOutcome,
};
pub use shutdown::ShutdownCoordinator;
pub use sinks::{
    AuditSink, DbAuditSink, DbIncidentSink, IncidentSink, Observers, SinkFuture,
    TracingAuditSink, TracingIncidentSink,
};
