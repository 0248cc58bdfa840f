use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use cg_types::{CallGuardError, Result};

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays OPEN before admitting a probe.
    pub reset_timeout_ms: u64,
    /// Consecutive probe successes in HALF_OPEN required to close.
    pub recovery_threshold: u32,
    /// Capacity of the recent-errors ring buffer.
    pub error_history_size: usize,
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            recovery_threshold: 3,
            error_history_size: 10,
        }
    }
}

/// Priority request queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub requests_per_second: f64,
    pub max_throttle_retries: u32,
    pub base_retry_delay_ms: u64,
}

impl QueueConfig {
    /// Minimum spacing between two dispatches.
    ///
    /// Fails unless the rate is positive and its reciprocal fits a `Duration`.
    pub fn min_interval(&self) -> Result<Duration> {
        if self.requests_per_second.is_nan() || self.requests_per_second <= 0.0 {
            return Err(CallGuardError::Config(format!(
                "requests_per_second must be positive, got {}",
                self.requests_per_second
            )));
        }
        Duration::try_from_secs_f64(1.0 / self.requests_per_second).map_err(|e| {
            CallGuardError::Config(format!(
                "requests_per_second {} is out of range: {e}",
                self.requests_per_second
            ))
        })
    }

    /// Requeue delay after the `retry_count`-th throttle: `base * 2^(n-1)`.
    pub fn throttle_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count.saturating_sub(1));
        Duration::from_millis(self.base_retry_delay_ms.saturating_mul(factor))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            max_throttle_retries: 3,
            base_retry_delay_ms: 5000,
        }
    }
}

/// Per-call retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint_name: String,

    pub breaker: BreakerConfig,
    pub queue: QueueConfig,
    pub retry: RetryOptions,
    /// Upper bound on concurrently tracked retried operations.
    pub max_in_flight_retries: usize,

    // Storage
    pub db_path: PathBuf,

    // Logging
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub log_structured: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_name: "crm".to_string(),
            breaker: BreakerConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryOptions::default(),
            max_in_flight_retries: 1024,
            db_path: PathBuf::from("./store/callguard.db"),
            log_level: "info".to_string(),
            log_file: None,
            log_structured: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with dotenvy).
    pub fn load() -> Result<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup and validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Config::default();

        let config = Config {
            endpoint_name: env.string("ENDPOINT_NAME", defaults.endpoint_name),
            breaker: BreakerConfig {
                failure_threshold: env.parse("FAILURE_THRESHOLD", defaults.breaker.failure_threshold)?,
                reset_timeout_ms: env.parse("RESET_TIMEOUT_MS", defaults.breaker.reset_timeout_ms)?,
                recovery_threshold: env.parse("RECOVERY_THRESHOLD", defaults.breaker.recovery_threshold)?,
                error_history_size: env.parse("ERROR_HISTORY_SIZE", defaults.breaker.error_history_size)?,
            },
            queue: QueueConfig {
                requests_per_second: env.parse("REQUESTS_PER_SECOND", defaults.queue.requests_per_second)?,
                max_throttle_retries: env.parse("MAX_THROTTLE_RETRIES", defaults.queue.max_throttle_retries)?,
                base_retry_delay_ms: env.parse("BASE_RETRY_DELAY_MS", defaults.queue.base_retry_delay_ms)?,
            },
            retry: RetryOptions {
                max_attempts: env.parse("MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                base_delay_ms: env.parse("BASE_DELAY_MS", defaults.retry.base_delay_ms)?,
                max_delay_ms: env.parse("MAX_DELAY_MS", defaults.retry.max_delay_ms)?,
            },
            max_in_flight_retries: env.parse("MAX_IN_FLIGHT_RETRIES", defaults.max_in_flight_retries)?,
            db_path: env.opt("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            log_level: env.string("LOG_LEVEL", defaults.log_level),
            log_file: env.opt("LOG_FILE").map(PathBuf::from),
            log_structured: env.bool("LOG_STRUCTURED", defaults.log_structured),
        };

        config.validate()?;
        debug!(endpoint = %config.endpoint_name, "Configuration loaded");
        Ok(config)
    }

    /// Semantic checks. Reports every problem, not just the first.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if !self.queue.requests_per_second.is_finite() || self.queue.min_interval().is_err() {
            problems.push("REQUESTS_PER_SECOND must be a positive number".to_string());
        }
        if self.breaker.failure_threshold == 0 {
            problems.push("FAILURE_THRESHOLD must be at least 1".to_string());
        }
        if self.breaker.recovery_threshold == 0 {
            problems.push("RECOVERY_THRESHOLD must be at least 1".to_string());
        }
        if self.breaker.error_history_size == 0 {
            problems.push("ERROR_HISTORY_SIZE must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("MAX_ATTEMPTS must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            problems.push("BASE_DELAY_MS must not exceed MAX_DELAY_MS".to_string());
        }
        if self.max_in_flight_retries == 0 {
            problems.push("MAX_IN_FLIGHT_RETRIES must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CallGuardError::Config(problems.join("; ")))
        }
    }

    /// Create the directory that will hold the database file.
    pub fn create_directories(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CallGuardError::Config(format!(
                        "Failed to create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn opt(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|s| !s.trim().is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.opt(key).unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.opt(key)
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.opt(key) {
            Some(raw) => raw.trim().parse().map_err(|_| {
                CallGuardError::Config(format!("{key} has an invalid value: {raw:?}"))
            }),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn config_defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.endpoint_name, "crm");
        assert_eq!(cfg.queue.requests_per_second, 2.0);
        assert_eq!(cfg.queue.max_throttle_retries, 3);
        assert_eq!(cfg.queue.base_retry_delay_ms, 5000);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.reset_timeout_ms, 60_000);
        assert_eq!(cfg.breaker.recovery_threshold, 3);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.retry.max_delay_ms, 60_000);
        assert!(cfg.log_file.is_none());
    }

    #[test]
    fn config_overrides() {
        let cfg = from_pairs(&[
            ("REQUESTS_PER_SECOND", "5"),
            ("FAILURE_THRESHOLD", "2"),
            ("LOG_STRUCTURED", "yes"),
            ("DB_PATH", "/tmp/cg.db"),
        ])
        .unwrap();
        assert_eq!(cfg.queue.requests_per_second, 5.0);
        assert_eq!(cfg.breaker.failure_threshold, 2);
        assert!(cfg.log_structured);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/cg.db"));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = from_pairs(&[("MAX_ATTEMPTS", "  ")]).unwrap();
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn unparsable_value_is_rejected() {
        let err = from_pairs(&[("MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(err.to_string().contains("MAX_ATTEMPTS"));
    }

    #[test]
    fn validation_reports_every_problem() {
        let err = from_pairs(&[
            ("REQUESTS_PER_SECOND", "0"),
            ("MAX_ATTEMPTS", "0"),
            ("BASE_DELAY_MS", "5000"),
            ("MAX_DELAY_MS", "100"),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("REQUESTS_PER_SECOND"));
        assert!(msg.contains("MAX_ATTEMPTS"));
        assert!(msg.contains("BASE_DELAY_MS"));
    }

    #[test]
    fn min_interval_from_rate() {
        let q = QueueConfig::default();
        assert_eq!(q.min_interval().unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn min_interval_rejects_unrepresentable_rates() {
        for rps in [0.0, -1.0, f64::NAN, 1e-20] {
            let q = QueueConfig {
                requests_per_second: rps,
                ..Default::default()
            };
            assert!(
                matches!(q.min_interval(), Err(CallGuardError::Config(_))),
                "rate {rps} accepted"
            );
        }
    }

    #[test]
    fn tiny_rate_fails_validation() {
        let err = from_pairs(&[("REQUESTS_PER_SECOND", "1e-20")]).unwrap_err();
        assert!(err.to_string().contains("REQUESTS_PER_SECOND"));
    }

    #[test]
    fn throttle_delay_doubles() {
        let q = QueueConfig::default();
        assert_eq!(q.throttle_delay(1), Duration::from_secs(5));
        assert_eq!(q.throttle_delay(2), Duration::from_secs(10));
        assert_eq!(q.throttle_delay(3), Duration::from_secs(20));
    }

    #[test]
    fn throttle_delay_zero_count() {
        // saturating_sub(1) -> 0, 2^0 = 1
        assert_eq!(QueueConfig::default().throttle_delay(0), Duration::from_secs(5));
    }

    #[test]
    fn config_create_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config {
            db_path: tmp.path().join("store/nested/callguard.db"),
            ..Default::default()
        };
        cfg.create_directories().unwrap();
        assert!(tmp.path().join("store/nested").exists());
    }

    #[test]
    fn retry_options_serde_roundtrip() {
        let opts = RetryOptions {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 100,
        };
        let json = serde_json::to_string(&opts).unwrap();
        let back: RetryOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }
}
