use once_cell::sync::Lazy;
use std::sync::Mutex;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config;
use crate::error::{Error, Result};

static LOG_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

/// Installs the global subscriber. With a configured log path the output goes
/// through a non-blocking file appender whose guard is parked for the process
/// lifetime; otherwise logs go to stdout.
pub fn init_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config::get_config()?.log_path {
        Some(log_file_path) => {
            let log_dir_path = log_file_path
                .parent()
                .ok_or(Error::Custom("Could not get parent of log path".to_string()))?;

            let log_file = log_file_path
                .file_name()
                .ok_or(Error::Custom("Could not get file name of log path".to_string()))?;

            let file_appender = tracing_appender::rolling::never(log_dir_path, log_file);
            let (non_blocking_writer, guard) = non_blocking(file_appender);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(BoxMakeWriter::new(non_blocking_writer))
                .with_ansi(false)
                .with_level(true)
                .init();

            *LOG_GUARD
                .lock()
                .map_err(|_| Error::Custom("Failed to lock log guard => poisoned?".to_string()))? =
                Some(guard);
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_level(true)
                .init();
        }
    }

    Ok(())
}
