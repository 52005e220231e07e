//! Structured logging setup.
//!
//! Built on `tracing-subscriber`. Without `RUST_LOG` the configured level
//! applies to this crate and the `mca_count` tool; everything else logs at
//! `warn`.
//!
//! # Example
//! ```no_run
//! use rust_mca::{config::McaConfig, logging};
//!
//! let config = McaConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(channels = config.channels.len(), "Configuration loaded");
//! # Ok::<(), rust_mca::McaError>(())
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LoggingConfig, McaConfig};
use crate::error::{McaError, Result};

/// Targets that follow the configured level.
const CRATE_TARGETS: [&str; 2] = ["rust_mca", "mca_count"];

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, colored, with source locations
    #[default]
    Pretty,
    /// Single line per event, no colors
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = McaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(McaError::invalid_config(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            ))),
        }
    }
}

/// Subscriber options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Level for this crate when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Options from the `[logging]` section.
    pub fn from_logging_config(config: &LoggingConfig) -> Result<Self> {
        Ok(Self {
            level: parse_log_level(&config.level)?,
            format: config.format.parse()?,
        })
    }

    /// Pretty output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Pretty,
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Filter directives used when `RUST_LOG` is unset.
    pub fn default_directives(&self) -> String {
        let level = self.level.as_str().to_lowercase();
        let mut directives = vec!["warn".to_string()];
        directives.extend(CRATE_TARGETS.iter().map(|t| format!("{}={}", t, level)));
        directives.join(",")
    }
}

/// Initialize from the loaded configuration.
pub fn init_from_config(config: &McaConfig) -> Result<()> {
    init(TracingConfig::from_logging_config(&config.logging)?)
}

/// Install the global subscriber.
///
/// A subscriber that is already installed is kept and `Ok(())` returned.
pub fn init(config: TracingConfig) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.default_directives()))
        .map_err(|e| McaError::invalid_config(format!("Invalid log filter: {}", e)))?;

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        OutputFormat::Compact => fmt::layer().compact().with_ansi(false).boxed(),
        OutputFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    match tracing_subscriber::registry().with(layer).with(filter).try_init() {
        Ok(()) => Ok(()),
        // lost a race with another initializer
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(McaError::invalid_config(format!(
            "Failed to initialize tracing: {}",
            e
        ))),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim()).map_err(|_| {
        McaError::invalid_config(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("Warn").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_from_logging_config() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            format: "JSON".to_string(),
        };
        let config = TracingConfig::from_logging_config(&logging).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_directives_scope_crate_targets() {
        let config = TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact);
        assert_eq!(
            config.default_directives(),
            "warn,rust_mca=debug,mca_count=debug"
        );
        assert!(EnvFilter::try_new(config.default_directives()).is_ok());
    }

    #[test]
    fn test_init_twice_is_ok() {
        let config = TracingConfig::new(Level::ERROR).with_format(OutputFormat::Compact);
        init(config.clone()).unwrap();
        init(config).unwrap();
    }
}
