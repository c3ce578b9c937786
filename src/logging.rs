//! Tracing setup for the CLI and structured logging helpers
//!
//! Library code only emits `tracing` events; installing a subscriber is up
//! to the binary (or a test, see `test_utils`).

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tracing target used for lines the language server writes to stderr
pub const SERVER_STDERR_TARGET: &str = "polyglot_lsp::server_stderr";

const DEFAULT_LOG_LEVEL: &str = "warn";

/// Errors installing the global subscriber
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Cannot open log file {path}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Where and how log events are written
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info,polyglot_lsp::server_stderr=debug`
    pub level: String,
    /// Log file; stderr when `None`
    pub file_path: Option<PathBuf>,
    /// One JSON object per event
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Read `RUST_LOG`, `POLYGLOT_LSP_LOG_FILE`, `POLYGLOT_LSP_LOG_UNIQUE`
    /// and `POLYGLOT_LSP_LOG_JSON`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = env::var("RUST_LOG") {
            config.level = level;
        }

        config.file_path = env::var_os("POLYGLOT_LSP_LOG_FILE").map(|path| {
            let path = PathBuf::from(path);
            if env_flag("POLYGLOT_LSP_LOG_UNIQUE") {
                unique_log_path(&path, std::process::id())
            } else {
                path
            }
        });
        config.json_format = env_flag("POLYGLOT_LSP_LOG_JSON");

        config
    }

    /// Apply CLI flags on top of the environment
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if file_path.is_some() {
            self.file_path = file_path;
        }
        self
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// `lsp.log` -> `lsp.<pid>.log`, so concurrent sessions don't interleave
fn unique_log_path(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };

    let file_name = match path.extension() {
        Some(extension) => format!(
            "{}.{}.{}",
            stem.to_string_lossy(),
            pid,
            extension.to_string_lossy()
        ),
        None => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(file_name)
}

/// Install the global subscriber described by `config`
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(&config.level)
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL))?;

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry.with(layer.json()).try_init()?;
    } else {
        registry
            .with(
                layer
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init()?;
    }

    Ok(())
}

/// Log one JSON-RPC message as a single structured event
#[macro_export]
macro_rules! log_lsp_message {
    ($level:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = $method,
            data = ?$data,
            "LSP message"
        );
    };
}

/// Log how long an operation took, in milliseconds
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis() as u64,
            "Timing"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_log_path_keeps_extension() {
        assert_eq!(
            unique_log_path(Path::new("/tmp/lsp.log"), 42),
            PathBuf::from("/tmp/lsp.42.log")
        );
        assert_eq!(
            unique_log_path(Path::new("/tmp/lsp"), 42),
            PathBuf::from("/tmp/lsp.42")
        );
    }

    #[test]
    fn test_overrides_take_precedence() {
        let config = LogConfig::default()
            .with_overrides(Some("debug".to_string()), Some(PathBuf::from("out.log")));

        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("out.log")));
        assert!(!config.json_format);

        let untouched = LogConfig::default().with_overrides(None, None);
        assert_eq!(untouched.level, "warn");
        assert!(untouched.file_path.is_none());
    }

    #[test]
    fn test_unopenable_log_file_is_reported() {
        let config = LogConfig {
            file_path: Some(PathBuf::from("/nonexistent-dir/polyglot.log")),
            ..LogConfig::default()
        };

        assert!(matches!(
            init_logging(config),
            Err(LoggingError::File { .. })
        ));
    }
}
