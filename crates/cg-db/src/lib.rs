pub mod audit;
pub mod connection;
pub mod incidents;

pub use audit::{AuditRepository, EventCount};
pub use connection::Database;
pub use incidents::IncidentRepository;
