//! Structured logging for FluxVault keepers and agents
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines for log aggregation (default)
//! - **Pretty Console**: Human-readable output for development
//! - **File Rotation**: Daily/hourly rotating JSONL files via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use fluxvault_logging::{FluxvaultSubscriberBuilder, LogConfig};
//!
//! // Development mode with pretty human-readable output
//! let _guard = FluxvaultSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .try_init()?;
//! ```
//!
//! Keep the returned guard alive for as long as the process logs to files;
//! dropping it flushes and stops the background writer.

pub mod config;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use tracing_appender::non_blocking::WorkerGuard;

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Level or directive string rejected
    #[error("Invalid log filter {directive:?}: {reason}")]
    Filter { directive: String, reason: String },

    /// Log directory or file could not be created
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rolling appender could not be built
    #[error("File appender error: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    /// A global subscriber is already installed
    #[error("Subscriber already installed: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Result type for logging setup
pub type LoggingResult<T> = Result<T, LoggingError>;

/// Builder for configuring and initializing the FluxVault logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output during development.
#[derive(Debug, Default)]
pub struct FluxvaultSubscriberBuilder {
    config: LogConfig,
}

impl FluxvaultSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Use human-readable console output
    pub fn with_pretty_console(mut self, ansi: bool) -> Self {
        self.config.console.pretty = true;
        self.config.console.ansi = ansi;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Install the subscriber globally
    ///
    /// Returns the file writer's guard when file output is configured.
    pub fn try_init(self) -> LoggingResult<Option<WorkerGuard>> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => level_filter(&self.config.default_level)?,
        };

        let mut outputs = Vec::new();
        if self.config.console.enabled {
            outputs.push(layers::console_layer(&self.config.console, &self.config.jsonl));
        }
        let guard = match &self.config.file {
            Some(file) => {
                let (writer, guard) = layers::file_writer(file)?;
                outputs.push(layers::jsonl_layer(writer, &self.config.jsonl));
                Some(guard)
            }
            None => None,
        };

        Registry::default().with(outputs).with(filter).try_init()?;
        Ok(guard)
    }
}

/// Filter from a level or directive string such as `info,fluxvault_agent=debug`
pub fn level_filter(directive: &str) -> LoggingResult<EnvFilter> {
    EnvFilter::try_new(directive).map_err(|e| LoggingError::Filter {
        directive: directive.to_string(),
        reason: e.to_string(),
    })
}
