//! Logging setup for applications embedding Switchyard
//!
//! Every Switchyard crate emits structured `tracing` events. This module
//! installs a `tracing-subscriber` registry for them: an `EnvFilter`
//! (`RUST_LOG` overrides the configured level), one of four formats, and a
//! non-blocking writer to STDOUT, STDERR or rolling files.
//!
//! ```no_run
//! use switchyard::logging::*;
//!
//! let _guard = LogConfig::new()
//!     .level(LogLevel::Debug)
//!     .format(LogFormat::Pretty)
//!     .init()
//!     .expect("logging");
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to string for EnvFilter
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Output format for log messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured, machine-readable (default)
    Json,
    /// Simple, human-readable
    Plain,
    /// Multi-line and colored, for development
    Pretty,
    /// Single-line, minimal
    Compact,
}

/// Output destination for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Rolling files under [`LogConfig::directory`]
    File,
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl Rotation {
    fn to_tracing_rotation(self) -> tracing_appender::rolling::Rotation {
        match self {
            Rotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
            Rotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
            Rotation::Daily => tracing_appender::rolling::Rotation::DAILY,
            Rotation::Never => tracing_appender::rolling::Rotation::NEVER,
        }
    }
}

/// Error installing the global subscriber
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to open log directory: {0}")]
    File(String),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level used when `RUST_LOG` is unset
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Directory for [`LogOutput::File`]
    pub directory: String,
    /// File name prefix for [`LogOutput::File`]
    pub file_prefix: String,
    pub rotation: Rotation,
    /// Include target (module path)
    pub targets: bool,
    pub thread_ids: bool,
    /// Enable ANSI colors (plain and pretty formats)
    pub colors: bool,
    /// Explicit filter directive, e.g. `switchyard_cqrs=debug,info`. Takes
    /// precedence over `level` and `RUST_LOG`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            directory: "logs".to_string(),
            file_prefix: "switchyard".to_string(),
            rotation: Rotation::Daily,
            targets: true,
            thread_ids: false,
            colors: false,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Write rolling files named `<prefix>.<date>` under `directory`.
    pub fn file(mut self, directory: impl Into<String>, prefix: impl Into<String>, rotation: Rotation) -> Self {
        self.output = LogOutput::File;
        self.directory = directory.into();
        self.file_prefix = prefix.into();
        self.rotation = rotation;
        self
    }

    pub fn with_targets(mut self, enable: bool) -> Self {
        self.targets = enable;
        self
    }

    pub fn with_thread_ids(mut self, enable: bool) -> Self {
        self.thread_ids = enable;
        self
    }

    pub fn with_colors(mut self, enable: bool) -> Self {
        self.colors = enable;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Build the filter: explicit directive, else `RUST_LOG`, else `level`.
    pub fn env_filter(&self) -> Result<EnvFilter, LogError> {
        match &self.filter {
            Some(directive) => EnvFilter::try_new(directive).map_err(|e| LogError::InvalidFilter {
                filter: directive.clone(),
                reason: e.to_string(),
            }),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }

    /// Install the global subscriber.
    ///
    /// Returns a guard that must be kept alive for the duration of the
    /// program; dropping it flushes buffered output.
    pub fn init(&self) -> Result<WorkerGuard, LogError> {
        let filter = self.env_filter()?;
        let (writer, guard) = self.writer()?;

        tracing_subscriber::registry()
            .with(self.layer(writer))
            .with(filter)
            .try_init()
            .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

        Ok(guard)
    }

    fn writer(&self) -> Result<(NonBlocking, WorkerGuard), LogError> {
        Ok(match self.output {
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::File => {
                let appender = tracing_appender::rolling::RollingFileAppender::builder()
                    .rotation(self.rotation.to_tracing_rotation())
                    .filename_prefix(&self.file_prefix)
                    .build(&self.directory)
                    .map_err(|e| LogError::File(e.to_string()))?;
                tracing_appender::non_blocking(appender)
            }
        })
    }

    fn layer(&self, writer: NonBlocking) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(self.targets)
            .with_thread_ids(self.thread_ids);

        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Plain => layer.with_ansi(self.colors).boxed(),
            LogFormat::Pretty => layer.pretty().with_ansi(self.colors).boxed(),
            LogFormat::Compact => layer.compact().with_ansi(false).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();

        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::Stdout);
    }

    #[test]
    fn test_deserialize_lowercase_enums() {
        let config: LogConfig = toml::from_str(
            r#"
            level = "debug"
            format = "compact"
            output = "file"
            directory = "/var/log/orders"
            rotation = "hourly"
            "#,
        )
        .unwrap();

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(config.rotation, Rotation::Hourly);
        assert_eq!(config.file_prefix, "switchyard");
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = LogConfig::new().with_filter("switchyard=notalevel");

        assert!(matches!(
            config.env_filter(),
            Err(LogError::InvalidFilter { .. })
        ));
    }
}
