//! Logging configuration.
//!
//! Structured logging through `tracing`, with the subscriber assembled from a
//! level, an output format and a few layout switches. `RUST_LOG` directives
//! are honored on top of the configured level.

use crate::errors::{GovernorError, GovernorResult};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The minimum log level to capture
    pub level: LogLevel,
    /// The output format for log messages
    pub format: LogFormat,
    /// Whether to include timestamps in log output
    pub include_timestamps: bool,
    /// Whether to include the module target in log output
    pub include_target: bool,
    /// Whether to include file and line number in log output
    pub include_file_line: bool,
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace-level logging (most verbose)
    Trace,
    /// Debug-level logging
    Debug,
    /// Info-level logging
    Info,
    /// Warning-level logging
    Warn,
    /// Error-level logging (least verbose)
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<LogLevel> for tracing::level_filters::LevelFilter {
    fn from(level: LogLevel) -> Self {
        Level::from(level).into()
    }
}

impl FromStr for LogLevel {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(GovernorError::configuration(format!(
                "unknown log level '{}'",
                other
            ))),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors (for development)
    Pretty,
    /// JSON format (for structured logging in production)
    Json,
    /// Compact format (for space-constrained environments)
    Compact,
}

impl FromStr for LogFormat {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(GovernorError::configuration(format!(
                "unknown log format '{}'",
                other
            ))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_timestamps: true,
            include_target: true,
            include_file_line: false,
        }
    }
}

impl LoggingConfig {
    /// Creates a new logging configuration with default settings.
    ///
    /// # Examples
    ///
    /// ```
    /// use integrations_inference_governor::observability::{LoggingConfig, LogLevel, LogFormat};
    ///
    /// let config = LoggingConfig::new();
    /// assert_eq!(config.level, LogLevel::Info);
    /// assert_eq!(config.format, LogFormat::Pretty);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `GOVERNOR_LOG_LEVEL` and `GOVERNOR_LOG_FORMAT`, keeping defaults
    /// for unset or unrecognized values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(level) = std::env::var("GOVERNOR_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.level = level;
        }
        if let Some(format) = std::env::var("GOVERNOR_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.format = format;
        }
        config
    }

    /// Sets the log level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the log format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets whether to include timestamps.
    pub fn with_timestamps(mut self, include: bool) -> Self {
        self.include_timestamps = include;
        self
    }

    /// Sets whether to include the module target.
    pub fn with_target(mut self, include: bool) -> Self {
        self.include_target = include;
        self
    }

    /// Sets whether to include file and line number.
    pub fn with_file_line(mut self, include: bool) -> Self {
        self.include_file_line = include;
        self
    }

    /// Installs the global subscriber.
    ///
    /// Call once at application startup.
    ///
    /// ```no_run
    /// use integrations_inference_governor::observability::{LoggingConfig, LogFormat};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// LoggingConfig::new().with_format(LogFormat::Json).init()?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a global subscriber is already set.
    pub fn init(self) -> GovernorResult<()> {
        let filter = EnvFilter::builder()
            .with_default_directive(tracing::level_filters::LevelFilter::from(self.level).into())
            .from_env_lossy();

        tracing_subscriber::registry()
            .with(self.layer())
            .with(filter)
            .try_init()
            .map_err(|e| GovernorError::configuration(format!("logging init failed: {}", e)))
    }

    fn layer<S>(&self) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let base = fmt::layer()
            .with_target(self.include_target)
            .with_file(self.include_file_line)
            .with_line_number(self.include_file_line);

        match (self.format, self.include_timestamps) {
            (LogFormat::Pretty, true) => base.with_ansi(true).boxed(),
            (LogFormat::Pretty, false) => base.with_ansi(true).without_time().boxed(),
            (LogFormat::Json, true) => base.json().boxed(),
            (LogFormat::Json, false) => base.json().without_time().boxed(),
            (LogFormat::Compact, true) => base.compact().boxed(),
            (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        }
    }
}

/// Log a failed governed call with its error kind.
pub fn log_error(error: &GovernorError, context: &str) {
    match error {
        GovernorError::CircuitOpen { .. } | GovernorError::RetriesExhausted { .. } => {
            tracing::warn!(kind = %error.kind(), error = %error, context, "Governed call failed");
        }
        _ => {
            tracing::error!(kind = %error.kind(), error = %error, context, "Governed call failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.include_timestamps);
        assert!(config.include_target);
        assert!(!config.include_file_line);
    }

    #[test]
    fn test_logging_config_builder_chain() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Trace)
            .with_format(LogFormat::Compact)
            .with_timestamps(false)
            .with_target(false)
            .with_file_line(true);

        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.format, LogFormat::Compact);
        assert!(!config.include_timestamps);
        assert!(!config.include_target);
        assert!(config.include_file_line);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(" warning ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_layers_build_for_every_format() {
        for format in [LogFormat::Pretty, LogFormat::Json, LogFormat::Compact] {
            for timestamps in [true, false] {
                let config = LoggingConfig::new()
                    .with_format(format)
                    .with_timestamps(timestamps);
                let _layer = config.layer::<tracing_subscriber::Registry>();
            }
        }
    }

    #[test]
    fn test_log_error() {
        // Should not panic
        log_error(&GovernorError::configuration("unknown selector"), "process");
        log_error(&GovernorError::CircuitOpen { retry_in: None }, "process");
    }
}
