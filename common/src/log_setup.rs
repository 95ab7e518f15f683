//! Tracing subscriber setup for applications and tests driving the engine.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Log file name prefix inside the log directory.
pub const LOG_FILE_PREFIX: &str = "picasso";

/// Installs the global subscriber: console output (warnings to stderr) plus a
/// daily rolling log file in `log_dir`.
///
/// `RUST_LOG` overrides `base_level` when set. Fails if a global subscriber is
/// already installed.
pub fn setup_logging(base_level: &str, log_dir: &Path) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(base_level))
        .with_context(|| format!("invalid log filter '{base_level}'"))?;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(5)
        .build(log_dir)
        .context("failed to create log file appender")?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        bail!("logging already initialized");
    }

    let console_writer = std::io::stdout.and(std::io::stderr.with_min_level(Level::WARN));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(console_writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("logger initialization failed")?;

    Ok(())
}

/// Routes `tracing` output through the test harness capture.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn setup_test_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");

        setup_logging("info", &log_dir).unwrap();
        tracing::info!("log setup test line");

        assert!(log_dir.is_dir());
        let has_log_file = std::fs::read_dir(&log_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX));
        assert!(has_log_file);

        // A second global subscriber is refused.
        assert!(setup_logging("info", &log_dir).is_err());
    }
}
