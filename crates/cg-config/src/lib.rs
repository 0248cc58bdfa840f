pub mod config;

pub use config::{BreakerConfig, Config, QueueConfig, RetryOptions};
