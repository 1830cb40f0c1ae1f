//! Tracing setup: leveled, structured logs written to a daily file.
//!
//! stdout belongs to the interactive loop, so nothing is logged there.

use std::path::Path;

use anyhow::{Context, Result};
pub use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable overriding the configured log filter.
pub const LOG_ENV: &str = "KILN_LOG";

/// Installs the global subscriber writing to `<log_dir>/kiln.log.<date>`.
///
/// The returned guard flushes buffered lines on drop; keep it alive for the
/// life of the process. Returns `Ok(None)` if a subscriber is already set.
///
/// # Errors
/// Returns an error if the log directory cannot be created.
pub fn init(log_dir: &Path, default_level: &str) -> Result<Option<WorkerGuard>> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log directory {}", log_dir.display()))?;

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let appender = tracing_appender::rolling::daily(log_dir, "kiln.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .is_ok();

    Ok(installed.then_some(guard))
}
