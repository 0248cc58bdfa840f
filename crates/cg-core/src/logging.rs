use std::path::Path;

use tracing_appender::rolling;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cg_types::{CallGuardError, Result};

const DEFAULT_LOG_FILE: &str = "callguard.log";

/// Initialize the tracing/logging system.
///
/// Console output is ANSI text, or JSON when `structured` is set. With
/// `log_file`, events are also written to a daily-rolling file next to it.
/// `RUST_LOG` overrides `log_level`. Fails if a subscriber is already set.
pub fn init_logging(log_level: &str, log_file: Option<&Path>, structured: bool) -> Result<()> {
    build_subscriber(log_level, log_file, structured)
        .try_init()
        .map_err(|e| CallGuardError::Other(format!("Logging already initialized: {e}")))
}

fn build_subscriber(
    log_level: &str,
    log_file: Option<&Path>,
    structured: bool,
) -> impl tracing::Subscriber + Send + Sync + 'static {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console = if structured {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .boxed()
    };

    let file = log_file.map(|log_path| {
        let dir = log_path.parent().unwrap_or(Path::new("."));
        let filename = log_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string());
        let appender = rolling::daily(dir, filename);

        if structured {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(appender)
                .with_target(true)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(appender)
                .with_target(true)
                .with_ansi(false)
                .boxed()
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
}
