// Logging setup shared by the master and its workers

use crate::config::ClusterConfig;
use crate::error::{Result, VigilError};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, time::ChronoLocal};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Build the log filter: `RUST_LOG` wins over the configured level
pub fn build_filter(config: &ClusterConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(&config.log_level).map_err(|e| {
        VigilError::ConfigValidationError(format!(
            "Invalid log level '{}': {}",
            config.log_level, e
        ))
    })
}

/// Install the global subscriber
///
/// With a log file configured, the returned guard must be held until the
/// process exits so buffered lines are flushed. Installing twice is a no-op.
pub fn init(config: &ClusterConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;

    match config.log_file {
        Some(ref path) => {
            let appender = file_appender(path)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = fmt::layer()
                .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(writer);

            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init();

            Ok(Some(guard))
        }
        None => {
            let layer = fmt::layer()
                .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                .with_writer(std::io::stderr);

            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init();

            Ok(None)
        }
    }
}

/// Appender for a single, never-rotated file shared by all processes of the pool
fn file_appender(path: &Path) -> Result<RollingFileAppender> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            VigilError::LogError(format!("Invalid log file path: {}", path.display()))
        })?;

    std::fs::create_dir_all(directory).map_err(|e| {
        VigilError::LogError(format!(
            "Failed to create log directory {}: {}",
            directory.display(),
            e
        ))
    })?;

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(directory)
        .map_err(|e| {
            VigilError::LogError(format!(
                "Failed to open log file {}: {}",
                path.display(),
                e
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_invalid_log_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = ClusterConfig {
            log_level: "vigil=loud".to_string(),
            ..ClusterConfig::default()
        };

        assert!(matches!(
            build_filter(&config),
            Err(VigilError::ConfigValidationError(_))
        ));
    }

    #[test]
    fn test_file_appender_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs").join("vigil.log");

        file_appender(&path).unwrap();

        assert!(temp_dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_file_appender_rejects_bare_root() {
        assert!(matches!(
            file_appender(Path::new("/")),
            Err(VigilError::LogError(_))
        ));
    }
}
