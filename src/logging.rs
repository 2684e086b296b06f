//! Tracing subscriber setup.
//!
//! The terminal is owned by the TUI, so logs go to a daily rolling file in
//! the log directory instead of stdout/stderr.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "hearthmux.log";

/// Install the global subscriber.
///
/// Returns the appender guard that must be held until exit so buffered
/// lines are flushed, or `None` when no log directory can be resolved.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let Some(dir) = crate::paths::log_directory() else {
        return Ok(None);
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_names(true)
        .with_env_filter(env_filter(config))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))?;

    Ok(Some(guard))
}

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}
