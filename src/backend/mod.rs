//! Backend adapters: one capability set, three transports.
//!
//! Every channel is bound to exactly one [`McaBackend`] when it is opened:
//!
//! - [`ModuleLibraryBackend`] - vendor library addressed by module and
//!   sub-channel
//! - [`DetectorLibraryBackend`] - vendor library addressed by a flat
//!   detector-channel index, with optional hardware SCAs
//! - [`RemoteProxyBackend`] - named fields on a remote peer
//!
//! The controller never inspects which variant it holds; differences show
//! up only through [`BackendCapabilities`] and the optional operations, which
//! return [`McaError::Unsupported`] by default.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{McaError, Result};
use crate::preset::PresetSpec;
use crate::statistics::RunStatistics;
use crate::timing::ClockTickModel;

pub mod detector_library;
pub mod module_library;
pub mod remote;
pub mod simulator;

pub use detector_library::{DetectorLibrary, DetectorLibraryBackend};
pub use module_library::{ModuleLibrary, ModuleLibraryBackend};
pub use remote::{RemoteFieldTransport, RemoteProxyBackend, SimulatedRemotePeer, TcpFieldClient};
pub use simulator::{
    SimulatedDetectorLibrary, SimulatedHardware, SimulatedModuleLibrary, SimulatorSettings,
};

/// Status code returned by a vendor library call.
pub type NativeResult<T> = std::result::Result<T, i32>;

/// Run counters as the local vendor libraries report them.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NativeStatistics {
    /// Real time in runtime clock ticks
    pub real_time_ticks: u64,
    /// Live time in runtime clock ticks
    pub live_time_ticks: u64,
    /// Input count rate in counts/s
    pub input_count_rate: f64,
    /// Output count rate in counts/s
    pub output_count_rate: f64,
    /// Fast filter peaks
    pub fast_peaks: u64,
    /// Binned events
    pub events: u64,
    /// Underflows, when the firmware exposes them
    pub underflows: Option<u64>,
    /// Overflows, when the firmware exposes them
    pub overflows: Option<u64>,
}

impl NativeStatistics {
    /// Convert to [`RunStatistics`] with times still in ticks.
    ///
    /// Counters the firmware does not expose are reported as zero.
    pub fn into_run_statistics(self, backend: &'static str) -> RunStatistics {
        if self.underflows.is_none() || self.overflows.is_none() {
            tracing::debug!(backend, "Underflow/overflow counters unavailable, reporting 0");
        }
        RunStatistics {
            real_time: self.real_time_ticks as f64,
            live_time: self.live_time_ticks as f64,
            input_count_rate: self.input_count_rate,
            output_count_rate: self.output_count_rate,
            num_fast_peaks: self.fast_peaks as f64,
            num_events: self.events as f64,
            num_underflows: self.underflows.unwrap_or(0) as f64,
            num_overflows: self.overflows.unwrap_or(0) as f64,
        }
    }
}

/// Hardware register names shared by the local libraries.
pub mod registers {
    /// Preset kind, module-wide
    pub const PRESET_KIND: &str = "PRESET_KIND";
    /// High-order preset word
    pub const PRESET_HIGH: &str = "PRESET_HIGH";
    /// Low-order preset word
    pub const PRESET_LOW: &str = "PRESET_LOW";
    /// Number of active hardware SCAs
    pub const NUM_SCAS: &str = "NUM_SCAS";
    /// Number of spectrum bins in use
    pub const MCA_BINS: &str = "NUMBER_MCA_CHANNELS";

    /// Low bin boundary register of hardware SCA `index`.
    pub fn sca_low(index: usize) -> String {
        format!("SCA{}LO", index)
    }

    /// High bin boundary register of hardware SCA `index`.
    pub fn sca_high(index: usize) -> String {
        format!("SCA{}HI", index)
    }
}

/// Backend-specific channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelAddress {
    /// Module plus sub-channel (module library)
    Module {
        /// Module index
        module: u32,
        /// Channel within the module
        sub_channel: u32,
    },
    /// Flat detector channel (detector library)
    Detector {
        /// Detector channel index
        detector_channel: u32,
    },
    /// Record name on a remote peer
    Remote {
        /// Remote record name
        record: String,
    },
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module {
                module,
                sub_channel,
            } => write!(f, "module {} channel {}", module, sub_channel),
            Self::Detector { detector_channel } => {
                write!(f, "detector channel {}", detector_channel)
            }
            Self::Remote { record } => write!(f, "remote record '{}'", record),
        }
    }
}

/// Capability flags reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    /// ROIs are mirrored into hardware SCA registers
    pub hardware_scas_are_enabled: bool,
    /// Baseline history can be read
    pub baseline_history: bool,
    /// Gain can be adjusted
    pub gain_adjustment: bool,
    /// Raw ADC traces can be read
    pub adc_trace: bool,
    /// Floating-point acquisition values can be read and written
    pub acquisition_values: bool,
    /// Presets are applied by the peer in a single exchange
    pub remote_presets: bool,
    /// Real and live time arrive in seconds instead of ticks
    pub statistics_in_seconds: bool,
}

/// Outcome of a spectrum read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumRead {
    /// `bins` values were copied into the buffer
    Complete {
        /// Number of bins written
        bins: usize,
    },
    /// The channel was running, nothing was read
    SkippedBusy,
}

impl SpectrumRead {
    /// Bins read, zero when skipped.
    pub fn bins(&self) -> usize {
        match self {
            Self::Complete { bins } => *bins,
            Self::SkippedBusy => 0,
        }
    }
}

/// The acquisition capability set every backend implements.
pub trait McaBackend: Send {
    /// Short backend name used in errors and logs.
    fn backend_name(&self) -> &'static str;

    /// Address of the bound channel.
    fn address(&self) -> &ChannelAddress;

    /// Capability flags.
    fn capabilities(&self) -> BackendCapabilities;

    /// Native code that means "a run is already active", if the backend has one.
    fn run_active_code(&self) -> Option<i32> {
        None
    }

    /// Whether the channel is currently counting.
    fn is_busy(&mut self) -> Result<bool>;

    /// Read an integer register.
    fn read_parameter(&mut self, name: &str) -> Result<u32>;

    /// Write an integer register on this channel.
    fn write_parameter(&mut self, name: &str, value: u32) -> Result<()>;

    /// Write an integer register on every channel of this channel's module.
    fn write_parameter_to_all_channels(&mut self, name: &str, value: u32) -> Result<()>;

    /// Start a run using the programmed preset.
    fn start_run(&mut self, clear: bool) -> Result<()>;

    /// Stop the run and clear the hardware run-enable state.
    fn stop_run(&mut self) -> Result<()>;

    /// Copy the spectrum into `buffer`, clamped to its length.
    fn read_spectrum(&mut self, buffer: &mut [u32]) -> Result<SpectrumRead>;

    /// Read run statistics; times are ticks unless `statistics_in_seconds`.
    fn read_statistics(&mut self) -> Result<RunStatistics>;

    /// Start a run with a preset applied by the peer.
    fn start_with_preset(&mut self, _preset: &PresetSpec, _clear: bool) -> Result<()> {
        Err(unsupported(self.backend_name(), "start_with_preset"))
    }

    /// Tick lengths already known to the backend, skipping calibration.
    fn clock_ticks(&mut self) -> Result<Option<ClockTickModel>> {
        Ok(None)
    }

    /// Raw real-time counter value after a run, for runtime tick calibration.
    fn raw_real_time_ticks(&mut self) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Read the baseline history into `buffer`.
    fn read_baseline_history(&mut self, _buffer: &mut [u32]) -> Result<usize> {
        Err(unsupported(self.backend_name(), "read_baseline_history"))
    }

    /// Adjust the gain by a relative amount (0.01 = +1%).
    fn adjust_gain(&mut self, _gain_change: f64) -> Result<()> {
        Err(unsupported(self.backend_name(), "adjust_gain"))
    }

    /// Read a raw ADC trace sampled every `sample_ns`.
    fn read_adc_trace(&mut self, _sample_ns: f64, _buffer: &mut [u32]) -> Result<usize> {
        Err(unsupported(self.backend_name(), "read_adc_trace"))
    }

    /// Read a floating-point acquisition value.
    fn get_acquisition_value(&mut self, _name: &str) -> Result<f64> {
        Err(unsupported(self.backend_name(), "get_acquisition_value"))
    }

    /// Write a floating-point acquisition value.
    fn set_acquisition_value(&mut self, _name: &str, _value: f64) -> Result<()> {
        Err(unsupported(self.backend_name(), "set_acquisition_value"))
    }
}

pub(crate) fn unsupported(backend: &'static str, operation: &'static str) -> McaError {
    McaError::Unsupported { backend, operation }
}
