//! Logging setup: stderr by default, optionally a (daily-rolling) file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::AppError;

/// Initialize the global tracing subscriber.
///
/// Returns a guard that must stay alive for the life of the process when a
/// log file is configured; dropping it flushes and stops the writer thread.
pub fn init(level: &str, logging: &LoggingConfig) -> Result<Option<WorkerGuard>, AppError> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| AppError::Logger(format!("bad log level {level:?}: {e}")))?;

    match &logging.file {
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| AppError::Logger(e.to_string()))?;
            Ok(None)
        }
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| AppError::Logger(format!("bad log file path {}", path.display())))?;
            let appender = if logging.rotate {
                tracing_appender::rolling::daily(dir, name)
            } else {
                tracing_appender::rolling::never(dir, name)
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| AppError::Logger(e.to_string()))?;
            Ok(Some(guard))
        }
    }
}
