//! Preset stopping conditions.
//!
//! A [`PresetSpec`] is built fresh for every start request. Before it reaches
//! the hardware it is encoded into an [`EncodedPreset`]: the preset-kind
//! register value plus the two 16-bit halves of the preset word. Time presets
//! go through the [`ClockTickModel`]; event-count presets are split as-is.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{McaError, Result};
use crate::timing::{ClockTickModel, PresetRegisters};

/// Kind of preset that ends a run, with its hardware register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum PresetKind {
    /// Count until stopped
    #[default]
    None = 0,
    /// Elapsed real time
    RealTime = 1,
    /// Elapsed live time
    LiveTime = 2,
    /// Number of output events
    OutputEvents = 3,
    /// Number of input counts
    InputCounts = 4,
}

impl PresetKind {
    /// Value written to the preset-kind register.
    pub fn register_value(self) -> u32 {
        self as u32
    }

    /// Decode a preset-kind register value.
    pub fn from_register(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::RealTime),
            2 => Some(Self::LiveTime),
            3 => Some(Self::OutputEvents),
            4 => Some(Self::InputCounts),
            _ => None,
        }
    }

    /// True for presets expressed in seconds.
    pub fn is_time(self) -> bool {
        matches!(self, Self::RealTime | Self::LiveTime)
    }

    /// True for presets expressed as an event count.
    pub fn is_count(self) -> bool {
        matches!(self, Self::OutputEvents | Self::InputCounts)
    }
}

impl fmt::Display for PresetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::None => "none",
            Self::RealTime => "real_time",
            Self::LiveTime => "live_time",
            Self::OutputEvents => "output_events",
            Self::InputCounts => "input_counts",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for PresetKind {
    type Err = McaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "real_time" | "realtime" | "real" => Ok(Self::RealTime),
            "live_time" | "livetime" | "live" => Ok(Self::LiveTime),
            "output_events" | "events" => Ok(Self::OutputEvents),
            "input_counts" | "counts" => Ok(Self::InputCounts),
            other => Err(McaError::invalid_config(format!(
                "Unknown preset kind '{}'",
                other
            ))),
        }
    }
}

/// A requested stopping condition.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PresetSpec {
    /// What the preset counts
    pub kind: PresetKind,
    /// Seconds for time presets, events for count presets
    pub value: f64,
}

impl PresetSpec {
    /// Run until explicitly stopped.
    pub fn none() -> Self {
        Self::default()
    }

    /// Stop after `seconds` of real time.
    pub fn real_time(seconds: f64) -> Self {
        Self {
            kind: PresetKind::RealTime,
            value: seconds,
        }
    }

    /// Stop after `seconds` of live time.
    pub fn live_time(seconds: f64) -> Self {
        Self {
            kind: PresetKind::LiveTime,
            value: seconds,
        }
    }

    /// Stop after `events` output events.
    pub fn output_events(events: u64) -> Self {
        Self {
            kind: PresetKind::OutputEvents,
            value: events as f64,
        }
    }

    /// Stop after `counts` input counts.
    pub fn input_counts(counts: u64) -> Self {
        Self {
            kind: PresetKind::InputCounts,
            value: counts as f64,
        }
    }

    /// Encode into register values.
    pub fn encode(&self, clock: &ClockTickModel) -> Result<EncodedPreset> {
        let registers = match self.kind {
            PresetKind::None => PresetRegisters::default(),
            PresetKind::RealTime | PresetKind::LiveTime => clock.to_preset_ticks(self.value)?,
            PresetKind::OutputEvents | PresetKind::InputCounts => {
                if !self.value.is_finite() || self.value < 0.0 {
                    return Err(McaError::Range {
                        message: format!("Invalid {} preset {}", self.kind, self.value),
                        max_seconds: clock.max_preset_seconds(),
                    });
                }
                ClockTickModel::counts_to_registers(self.value.round() as u64)?
            }
        };

        Ok(EncodedPreset {
            kind: self.kind,
            registers,
        })
    }
}

/// A preset as the hardware sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EncodedPreset {
    /// Preset-kind register value
    pub kind: PresetKind,
    /// Preset word halves
    pub registers: PresetRegisters,
}
