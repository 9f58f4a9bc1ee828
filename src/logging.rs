// =============================================================================
// Logging — stdout + `app.log` in the data directory
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log file written next to the candle files.
pub const LOG_FILE_NAME: &str = "app.log";

/// Build the filter: `RUST_LOG` wins, otherwise `default_directive`.
fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Open `app.log` for appending, creating `data_dir` if needed.
fn file_appender(data_dir: &Path) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_NAME)
        .build(data_dir)
        .with_context(|| format!("failed to open {LOG_FILE_NAME} in {}", data_dir.display()))
}

/// Install the global subscriber.  The returned guard must live until exit or
/// buffered file lines are lost.
pub fn init(default_directive: &str, data_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create log dir {}", data_dir.display()))?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender(data_dir)?);

    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appender_creates_log_file_in_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("logs");
        file_appender(&nested).unwrap();
        assert!(nested.join(LOG_FILE_NAME).is_file());
    }

    #[test]
    fn unopenable_log_location_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let not_a_dir = dir.path().join("occupied");
        std::fs::write(&not_a_dir, b"plain file").unwrap();

        let err = file_appender(&not_a_dir).unwrap_err();
        assert!(err.to_string().contains(LOG_FILE_NAME));
    }
}
