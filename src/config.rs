//! Configuration loaded with Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. a TOML file (default `config/mca.toml`)
//! 2. environment variables prefixed with `RUST_MCA_`, nested keys separated
//!    by a double underscore (`RUST_MCA_LOGGING__LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use rust_mca::config::McaConfig;
//!
//! let config = McaConfig::load()?;
//! config.validate()?;
//! for channel in &config.channels {
//!     println!("{} -> {:?}", channel.id, channel.backend);
//! }
//! # Ok::<(), rust_mca::McaError>(())
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::backend::remote::{DEFAULT_PORT, DEFAULT_TIMEOUT_MS};
use crate::backend::SimulatorSettings;
use crate::controller::{ControllerOptions, RetryPolicy};
use crate::error::{McaError, Result};
use crate::timer::TimerMode;
use crate::timing::CalibrationSettings;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/mca.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RUST_MCA_";

/// Upper bound for `calibration_timeout_seconds`
pub const MAX_CALIBRATION_TIMEOUT_SECONDS: f64 = 3600.0;

/// Name used when a local channel does not name its library binding
pub const DEFAULT_LIBRARY: &str = "default";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McaConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Channel definitions
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

/// One MCA channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Unique channel id
    pub id: String,
    /// Spectrum capacity
    #[serde(default = "default_max_bins")]
    pub max_bins: usize,
    /// ROI table capacity
    #[serde(default = "default_max_rois")]
    pub max_rois: usize,
    /// Runtime tick in seconds; 0 triggers calibration
    #[serde(default)]
    pub runtime_tick_seconds: f64,
    /// Preset tick in seconds; 0 triggers calibration
    #[serde(default)]
    pub preset_tick_seconds: f64,
    /// Use simulated hardware instead of a library binding or a peer
    #[serde(default)]
    pub mock: bool,
    /// Clock counted by the timer facade
    #[serde(default)]
    pub timer_mode: TimerMode,
    /// Calibration run length
    #[serde(default = "default_calibration_target")]
    pub calibration_target_seconds: f64,
    /// Calibration deadline
    #[serde(default = "default_calibration_timeout")]
    pub calibration_timeout_seconds: f64,
    /// Backend selection and addressing
    pub backend: BackendConfig,
    /// Start retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Simulated hardware shape for mock channels
    #[serde(default)]
    pub simulator: SimulatorSettings,
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Module library, addressed by module and sub-channel
    ModuleLibrary {
        /// Module index
        module: u32,
        /// Channel within the module
        sub_channel: u32,
        /// Library binding name
        #[serde(default = "default_library")]
        library: String,
    },
    /// Detector library, addressed by detector channel
    DetectorLibrary {
        /// Detector channel index
        detector_channel: u32,
        /// Mirror ROIs into hardware SCAs
        #[serde(default)]
        hardware_scas: bool,
        /// Library binding name
        #[serde(default = "default_library")]
        library: String,
    },
    /// Remote peer over TCP
    Remote {
        /// Peer host
        host: String,
        /// Peer port
        #[serde(default = "default_port")]
        port: u16,
        /// Record name on the peer
        record: String,
        /// Exchange timeout
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

impl BackendConfig {
    /// Short backend kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModuleLibrary { .. } => "module_library",
            Self::DetectorLibrary { .. } => "detector_library",
            Self::Remote { .. } => "remote",
        }
    }
}

// Default value functions
fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

fn default_max_bins() -> usize {
    2048
}

fn default_max_rois() -> usize {
    16
}

fn default_calibration_target() -> f64 {
    0.1
}

fn default_calibration_timeout() -> f64 {
    10.0
}

fn default_library() -> String {
    DEFAULT_LIBRARY.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl McaConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse a TOML document, without environment overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Ok(Figment::new().merge(Toml::string(toml)).extract()?)
    }

    /// Check values serde cannot check.
    pub fn validate(&self) -> Result<()> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(McaError::invalid_config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }
        let format = self.logging.format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(McaError::invalid_config(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                VALID_FORMATS.join(", ")
            )));
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !ids.insert(channel.id.as_str()) {
                return Err(McaError::invalid_config(format!(
                    "Duplicate channel id: {}",
                    channel.id
                )));
            }
        }

        Ok(())
    }

    /// Render as TOML, e.g. to write out a starting configuration.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| McaError::invalid_config(format!("Failed to serialize config: {}", e)))
    }

    /// Channel by id.
    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }
}

impl ChannelConfig {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(McaError::invalid_config("Channel id must not be empty"));
        }
        if self.max_bins == 0 {
            return Err(McaError::invalid_config(format!(
                "Channel '{}': max_bins must be positive",
                self.id
            )));
        }
        for (name, value) in [
            ("runtime_tick_seconds", self.runtime_tick_seconds),
            ("preset_tick_seconds", self.preset_tick_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(McaError::invalid_config(format!(
                    "Channel '{}': {} must be 0 or positive, got {}",
                    self.id, name, value
                )));
            }
        }
        if self.calibration_target_seconds <= 0.0
            || self.calibration_timeout_seconds <= self.calibration_target_seconds
        {
            return Err(McaError::invalid_config(format!(
                "Channel '{}': calibration timeout must exceed a positive target",
                self.id
            )));
        }
        if self.calibration_timeout_seconds.is_nan()
            || self.calibration_timeout_seconds > MAX_CALIBRATION_TIMEOUT_SECONDS
        {
            return Err(McaError::invalid_config(format!(
                "Channel '{}': calibration_timeout_seconds must be at most {}, got {}",
                self.id, MAX_CALIBRATION_TIMEOUT_SECONDS, self.calibration_timeout_seconds
            )));
        }
        if self.retry.busy_poll_interval.is_zero() {
            return Err(McaError::invalid_config(format!(
                "Channel '{}': busy_poll_interval_ms must be positive",
                self.id
            )));
        }
        if let BackendConfig::Remote { host, record, .. } = &self.backend {
            if !self.mock && host.trim().is_empty() {
                return Err(McaError::invalid_config(format!(
                    "Channel '{}': remote host must not be empty",
                    self.id
                )));
            }
            if record.trim().is_empty() || record.contains('.') {
                return Err(McaError::invalid_config(format!(
                    "Channel '{}': invalid remote record '{}'",
                    self.id, record
                )));
            }
        }
        Ok(())
    }

    /// Controller options; zero ticks become "measure at open".
    pub fn controller_options(&self) -> ControllerOptions {
        let configured = |seconds: f64| (seconds > 0.0).then_some(seconds);
        ControllerOptions {
            max_bins: self.max_bins,
            max_rois: self.max_rois,
            runtime_tick_seconds: configured(self.runtime_tick_seconds),
            preset_tick_seconds: configured(self.preset_tick_seconds),
            calibration: CalibrationSettings {
                target_seconds: self.calibration_target_seconds,
                timeout_seconds: self.calibration_timeout_seconds,
                poll_interval: Duration::from_millis(1),
            },
            retry: self.retry.clone(),
        }
    }
}
