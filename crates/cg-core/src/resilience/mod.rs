pub mod circuit_breaker;
pub mod in_flight;
pub mod rate_gate;
pub mod request_queue;
pub mod retry;

pub use circuit_breaker::CircuitBreaker;
pub use in_flight::{InFlightGuard, InFlightRetries};
pub use rate_gate::RateGate;
pub use request_queue::{PriorityRequestQueue, QueuedCall};
pub use retry::{calculate_backoff, OnError, RetryOrchestrator, RetryOutcome};
