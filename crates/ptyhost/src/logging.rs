//! Tracing initialization.
//!
//! The `termmux` binary owns the terminal in raw mode, so log lines go to a
//! daily rolling file rather than stderr.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file name prefix inside the log directory.
pub const LOG_FILE_NAME: &str = "termmux.log";

/// Builds the filter: `RUST_LOG` when set, otherwise `level`.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber writing to `log_dir`.
///
/// The returned guard flushes buffered lines when dropped; keep it alive for
/// the life of the process.
pub fn init_tracing(level: &str, log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Installs a stderr subscriber for commands that do not take over the terminal.
pub fn init_stderr(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_filter_prefers_rust_log() {
        std::env::set_var("RUST_LOG", "router=trace");
        assert_eq!(env_filter("info").to_string(), "router=trace");
        std::env::remove_var("RUST_LOG");

        assert_eq!(env_filter("warn").to_string(), "warn");
    }
}
