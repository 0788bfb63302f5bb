// Logging setup
//
// One registry with an EnvFilter, a stdout layer (text or JSON) and an
// optional rolling JSON file layer behind a non-blocking writer.
//
// Precedence for the filter: RUST_LOG env var > [logging] level > "info"

use crate::config::{LogFormat, LoggingConfig};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when RUST_LOG is unset: our crate at `level`, dependencies at warn
pub fn default_directive(level: &str) -> String {
    format!("warn,pipestore={}", level.trim().to_lowercase())
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. `None` when file logging is off or its directory
/// could not be prepared (stdout logging still works then).
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.level)));

    let stdout = match config.format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    let (file_layer, guard) = match file_writer(config) {
        Some((writer, guard)) => (
            Some(fmt::layer().json().with_writer(writer).with_ansi(false)),
            Some(guard),
        ),
        None => (None, None),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(stdout)
        .with(file_layer)
        .with(filter)
        .try_init()
    {
        // Only happens when something else already installed a subscriber
        eprintln!("Warning: logging already initialised: {}", e);
    }

    guard
}

/// Rolling non-blocking writer for the file layer, if enabled
fn file_writer(config: &LoggingConfig) -> Option<(NonBlocking, WorkerGuard)> {
    if !config.file_enabled {
        return None;
    }

    if let Err(e) = std::fs::create_dir_all(&config.file_dir) {
        eprintln!(
            "Warning: Could not create log directory {:?}: {}",
            config.file_dir, e
        );
        return None;
    }

    let appender = RollingFileAppender::builder()
        .rotation(config.file_rotation.rotation())
        .filename_prefix(&config.file_prefix)
        .build(&config.file_dir);

    match appender {
        Ok(appender) => Some(tracing_appender::non_blocking(appender)),
        Err(e) => {
            eprintln!(
                "Warning: Could not open log file in {:?}: {}",
                config.file_dir, e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_directive_scopes_level_to_crate() {
        assert_eq!(default_directive("DEBUG"), "warn,pipestore=debug");
        assert!(EnvFilter::try_new(default_directive("trace")).is_ok());
    }

    #[test]
    fn test_file_writer_disabled() {
        assert!(file_writer(&LoggingConfig::default()).is_none());
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = TempDir::new().unwrap();
        let config = LoggingConfig {
            file_enabled: true,
            file_dir: dir.path().join("nested").join("logs"),
            ..Default::default()
        };

        let writer = file_writer(&config);
        assert!(writer.is_some());
        assert!(config.file_dir.is_dir());
    }
}
