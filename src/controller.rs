//! Per-channel acquisition controller.
//!
//! [`AcquisitionController`] owns one channel and the backend it is bound
//! to. It sequences preset programming and run start, detects the end of a
//! run by polling, and caches statistics so that repeated reads of the same
//! run do not go back to the hardware.
//!
//! # State Machine
//!
//! ```text
//!            start()              backend started
//!   Idle ─────────────► Starting ─────────────────► Running
//!    ▲                     │ error                     │
//!    │◄────────────────────┘                           │ stop() or
//!    │                                                 │ busy went false
//!    └──────────────────── Stopping ◄──────────────────┘
//! ```
//!
//! # Start Sequence
//!
//! 1. Encode the preset with the channel's [`ClockTickModel`].
//! 2. If the encoding differs from the last applied one, write
//!    `PRESET_KIND` to every channel of the module, then `PRESET_HIGH` and
//!    `PRESET_LOW` on this channel. The new encoding is remembered only after
//!    all three writes succeed.
//! 3. Mark the statistics cache dirty.
//! 4. Start the run. If the backend reports its "run already active" code,
//!    stop, wait for idle and start again, up to
//!    [`RetryPolicy::max_start_retries`] times.
//!
//! Backends with `remote_presets` replace steps 2 and 4 with a single
//! `start_with_preset` exchange.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{registers, BackendCapabilities, McaBackend, SpectrumRead};
use crate::derived;
use crate::error::{McaError, Result};
use crate::preset::{EncodedPreset, PresetKind, PresetSpec};
use crate::statistics::{RunStatistics, StatisticsCache};
use crate::timing::{CalibrationSettings, ClockTickModel, PresetRegisters, TimedRun};

/// Channel identifier used by the registry and configuration.
pub type ChannelId = String;

/// Inclusive bin range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    /// First bin
    pub low: usize,
    /// Last bin, inclusive
    pub high: usize,
}

impl Roi {
    /// Build a ROI; `low` must not exceed `high`.
    pub fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// Number of bins covered.
    pub fn width(&self) -> usize {
        self.high.saturating_sub(self.low) + 1
    }
}

/// Acquisition state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// Not counting
    #[default]
    Idle,
    /// Preset programming and start in progress
    Starting,
    /// Counting
    Running,
    /// Stop in progress
    Stopping,
}

/// Channel bookkeeping visible to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Registry id
    pub id: ChannelId,
    /// Bins in the last spectrum read
    pub current_bins: usize,
    /// Spectrum capacity
    pub max_bins: usize,
    /// Software ROI table
    pub rois: Vec<Roi>,
    /// ROI table capacity
    pub max_rois: usize,
    /// Last observed busy state
    pub busy: bool,
}

fn default_max_start_retries() -> u32 {
    5
}

fn default_busy_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_stop_wait_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Recovery from a stale "run already active" state at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Stop-and-restart attempts after the first failed start
    #[serde(default = "default_max_start_retries")]
    pub max_start_retries: u32,
    /// Sleep between busy polls
    #[serde(
        rename = "busy_poll_interval_ms",
        default = "default_busy_poll_interval",
        with = "duration_ms"
    )]
    pub busy_poll_interval: Duration,
    /// Deadline for the channel to go idle after a stop
    #[serde(
        rename = "stop_wait_timeout_ms",
        default = "default_stop_wait_timeout",
        with = "duration_ms"
    )]
    pub stop_wait_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_start_retries: default_max_start_retries(),
            busy_poll_interval: default_busy_poll_interval(),
            stop_wait_timeout: default_stop_wait_timeout(),
        }
    }
}

/// Durations as integer milliseconds in configuration files.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Options for [`AcquisitionController::open`].
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Spectrum capacity
    pub max_bins: usize,
    /// ROI table capacity
    pub max_rois: usize,
    /// Known runtime tick; measured when absent
    pub runtime_tick_seconds: Option<f64>,
    /// Known preset tick; measured when absent
    pub preset_tick_seconds: Option<f64>,
    /// Calibration run parameters
    pub calibration: CalibrationSettings,
    /// Start retry policy
    pub retry: RetryPolicy,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_bins: 2048,
            max_rois: 16,
            runtime_tick_seconds: None,
            preset_tick_seconds: None,
            calibration: CalibrationSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Acquisition controller for one channel.
pub struct AcquisitionController {
    channel: Channel,
    backend: Box<dyn McaBackend>,
    clock: ClockTickModel,
    retry: RetryPolicy,
    state: AcquisitionState,
    last_applied: Option<EncodedPreset>,
    statistics: StatisticsCache,
    spectrum: Vec<u32>,
    preset_programs: u64,
}

impl std::fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("channel", &self.channel)
            .field("backend", &self.backend.backend_name())
            .field("address", self.backend.address())
            .field("state", &self.state)
            .finish()
    }
}

impl AcquisitionController {
    /// Wrap a backend with an already known clock model.
    pub fn new(
        id: impl Into<ChannelId>,
        backend: Box<dyn McaBackend>,
        clock: ClockTickModel,
        options: &ControllerOptions,
    ) -> Self {
        Self {
            channel: Channel {
                id: id.into(),
                current_bins: 0,
                max_bins: options.max_bins,
                rois: Vec::new(),
                max_rois: options.max_rois,
                busy: false,
            },
            backend,
            clock,
            retry: options.retry.clone(),
            state: AcquisitionState::Idle,
            last_applied: None,
            statistics: StatisticsCache::new(),
            spectrum: vec![0; options.max_bins],
            preset_programs: 0,
        }
    }

    /// Open a channel, resolving its tick lengths.
    ///
    /// Ticks reported by the backend win. Otherwise configured values are
    /// used and any missing one is measured with a calibration run.
    pub fn open(
        id: impl Into<ChannelId>,
        mut backend: Box<dyn McaBackend>,
        options: &ControllerOptions,
    ) -> Result<Self> {
        let id = id.into();
        let clock = match backend.clock_ticks()? {
            Some(clock) => {
                debug!(channel = %id, "Using tick lengths reported by the backend");
                clock
            }
            None => resolve_clock(&id, &mut backend, options)?,
        };

        info!(
            channel = %id,
            backend = backend.backend_name(),
            address = %backend.address(),
            runtime_tick_ns = clock.runtime_tick_seconds() * 1e9,
            preset_tick_ns = clock.preset_tick_seconds() * 1e9,
            "Opened MCA channel"
        );

        Ok(Self::new(id, backend, clock, options))
    }

    /// Channel bookkeeping.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Registry id.
    pub fn id(&self) -> &str {
        &self.channel.id
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Clock model in use.
    pub fn clock(&self) -> &ClockTickModel {
        &self.clock
    }

    /// Backend capability flags.
    pub fn capabilities(&self) -> BackendCapabilities {
        self.backend.capabilities()
    }

    /// Backend name.
    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Start retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Replace the start retry policy.
    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Preset encoding currently programmed in hardware, if known.
    pub fn last_applied_preset(&self) -> Option<EncodedPreset> {
        self.last_applied
    }

    /// Number of times the preset registers were reprogrammed.
    pub fn preset_programs(&self) -> u64 {
        self.preset_programs
    }

    /// Number of statistics reads that reached the backend.
    pub fn statistics_hardware_reads(&self) -> u64 {
        self.statistics.hardware_reads()
    }

    /// Start a run that ends on `preset`.
    pub fn start(&mut self, preset: PresetSpec, clear: bool) -> Result<()> {
        self.state = AcquisitionState::Starting;
        match self.start_sequence(&preset, clear) {
            Ok(()) => {
                self.state = AcquisitionState::Running;
                self.channel.busy = true;
                info!(
                    channel = %self.channel.id,
                    preset = %preset.kind,
                    value = preset.value,
                    clear,
                    "Run started"
                );
                Ok(())
            }
            Err(e) => {
                self.state = AcquisitionState::Idle;
                self.channel.busy = false;
                warn!(channel = %self.channel.id, error = %e, "Run start failed");
                Err(e)
            }
        }
    }

    fn start_sequence(&mut self, preset: &PresetSpec, clear: bool) -> Result<()> {
        let encoded = preset.encode(&self.clock)?;
        if clear {
            self.channel.current_bins = 0;
        }

        if self.backend.capabilities().remote_presets {
            self.statistics.mark_run_started();
            return self.start_with_retry(Some(preset), clear);
        }

        if self.last_applied == Some(encoded) {
            debug!(channel = %self.channel.id, "Preset unchanged, skipping register writes");
        } else {
            self.program_preset(encoded)?;
        }

        self.statistics.mark_run_started();
        self.start_with_retry(None, clear)
    }

    fn program_preset(&mut self, encoded: EncodedPreset) -> Result<()> {
        self.last_applied = None;
        write_preset_registers(
            self.backend.as_mut(),
            encoded.kind.register_value(),
            encoded.registers,
        )?;
        self.last_applied = Some(encoded);
        self.preset_programs += 1;
        debug!(
            channel = %self.channel.id,
            kind = %encoded.kind,
            high = encoded.registers.high,
            low = encoded.registers.low,
            "Preset registers programmed"
        );
        Ok(())
    }

    fn issue_start(&mut self, preset: Option<&PresetSpec>, clear: bool) -> Result<()> {
        match preset {
            Some(preset) => self.backend.start_with_preset(preset, clear),
            None => self.backend.start_run(clear),
        }
    }

    fn start_with_retry(&mut self, preset: Option<&PresetSpec>, clear: bool) -> Result<()> {
        let first = match self.issue_start(preset, clear) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let run_active = self.backend.run_active_code();
        if run_active.is_none() || first.device_io_code() != run_active {
            return Err(first);
        }

        warn!(
            channel = %self.channel.id,
            "Backend reports a run already active, stopping it before restart"
        );

        for attempt in 1..=self.retry.max_start_retries {
            if let Err(e) = self.backend.stop_run() {
                debug!(attempt, error = %e, "Stop before restart failed");
            }
            if let Err(e) = self.wait_until_not_busy(self.retry.stop_wait_timeout) {
                debug!(attempt, error = %e, "Channel did not go idle before restart");
                continue;
            }
            match self.issue_start(preset, clear) {
                Ok(()) => {
                    info!(channel = %self.channel.id, attempt, "Run started after restart");
                    return Ok(());
                }
                Err(e) => debug!(attempt, error = %e, "Restart attempt failed"),
            }
        }

        Err(first)
    }

    fn wait_until_not_busy(&mut self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        while self.backend.is_busy()? {
            if started.elapsed() >= timeout {
                return Err(McaError::TimedOut {
                    operation: format!("waiting for channel '{}' to go idle", self.channel.id),
                    seconds: timeout.as_secs_f64(),
                });
            }
            std::thread::sleep(self.retry.busy_poll_interval);
        }
        Ok(())
    }

    /// Stop the run.
    pub fn stop(&mut self) -> Result<()> {
        self.state = AcquisitionState::Stopping;
        let result = self.backend.stop_run();
        self.state = AcquisitionState::Idle;
        self.channel.busy = false;
        self.statistics.mark_dirty();
        if result.is_ok() {
            info!(channel = %self.channel.id, "Run stopped");
        }
        result
    }

    /// Poll the hardware busy state.
    ///
    /// When a run ends on its preset the hardware run-enable state is left
    /// set; the first poll that sees busy drop issues exactly one stop.
    pub fn is_busy(&mut self) -> Result<bool> {
        let busy = self.backend.is_busy()?;

        if self.channel.busy && !busy {
            debug!(channel = %self.channel.id, "Run ended on preset, clearing run-enable");
            self.state = AcquisitionState::Stopping;
            let result = self.backend.stop_run();
            self.state = AcquisitionState::Idle;
            self.channel.busy = false;
            self.statistics.mark_dirty();
            result?;
        } else if busy && !self.channel.busy {
            self.channel.busy = true;
            self.state = AcquisitionState::Running;
        }

        Ok(busy)
    }

    /// Poll until the run ends or `timeout` expires.
    pub fn wait_for_idle(&mut self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        while self.is_busy()? {
            if started.elapsed() >= timeout {
                return Err(McaError::TimedOut {
                    operation: format!("run on channel '{}'", self.channel.id),
                    seconds: timeout.as_secs_f64(),
                });
            }
            std::thread::sleep(self.retry.busy_poll_interval);
        }
        Ok(())
    }

    /// Read the spectrum into `buffer` and keep a local copy for ROI sums.
    pub fn read_spectrum(&mut self, buffer: &mut [u32]) -> Result<SpectrumRead> {
        let read = self.backend.read_spectrum(buffer)?;
        if let SpectrumRead::Complete { bins } = read {
            let bins = bins.min(self.channel.max_bins);
            self.channel.current_bins = bins;
            self.spectrum[..bins].copy_from_slice(&buffer[..bins]);
        }
        Ok(read)
    }

    /// Refresh the local spectrum copy.
    pub fn refresh_spectrum(&mut self) -> Result<SpectrumRead> {
        let mut buffer = std::mem::take(&mut self.spectrum);
        let result = self.backend.read_spectrum(&mut buffer);
        self.spectrum = buffer;
        let read = result?;
        if let SpectrumRead::Complete { bins } = read {
            self.channel.current_bins = bins.min(self.channel.max_bins);
        }
        Ok(read)
    }

    /// Spectrum as of the last completed read.
    pub fn spectrum(&self) -> &[u32] {
        &self.spectrum[..self.channel.current_bins]
    }

    /// Statistics of the current or last run, times in seconds.
    ///
    /// A value read after the latest start is returned without touching the
    /// hardware. While the run is active the cached value is returned as-is;
    /// the hardware is read only when nothing is cached yet.
    pub fn read_statistics(&mut self) -> Result<RunStatistics> {
        self.statistics_inner(false)
    }

    /// Read statistics from the hardware even mid-run.
    pub fn read_statistics_forced(&mut self) -> Result<RunStatistics> {
        self.statistics_inner(true)
    }

    fn statistics_inner(&mut self, force: bool) -> Result<RunStatistics> {
        if !force && self.statistics.is_fresh() {
            if let Some(cached) = self.statistics.cached() {
                return Ok(*cached);
            }
        }

        let running = self.state == AcquisitionState::Running;
        if running && !force {
            if let Some(cached) = self.statistics.cached() {
                return Ok(*cached);
            }
        }

        let raw = self.backend.read_statistics()?;
        let stats = self.to_seconds(raw);
        if running && !force {
            self.statistics.store_provisional(stats);
        } else {
            self.statistics.store(stats);
        }
        Ok(stats)
    }

    fn to_seconds(&self, mut stats: RunStatistics) -> RunStatistics {
        if !self.backend.capabilities().statistics_in_seconds {
            stats.real_time = self.clock.runtime_ticks_to_seconds(stats.real_time);
            stats.live_time = self.clock.runtime_ticks_to_seconds(stats.live_time);
        }
        stats
    }

    /// Zero the spectrum and counters.
    ///
    /// An idle channel is cleared with a momentary clearing run.
    pub fn clear(&mut self) -> Result<()> {
        if self.state == AcquisitionState::Idle {
            self.backend.start_run(true)?;
            self.backend.stop_run()?;
        }
        self.spectrum.iter_mut().for_each(|bin| *bin = 0);
        self.channel.current_bins = 0;
        self.statistics.clear();
        debug!(channel = %self.channel.id, "Channel cleared");
        Ok(())
    }

    /// Set ROI `index`; `index` may extend the table by one.
    pub fn set_roi(&mut self, index: usize, roi: Roi) -> Result<()> {
        self.validate_roi(index, roi)?;
        if index > self.channel.rois.len() {
            return Err(McaError::InvalidRoi {
                index,
                message: format!(
                    "ROIs are contiguous, next free index is {}",
                    self.channel.rois.len()
                ),
            });
        }

        let appending = index == self.channel.rois.len();
        if self.backend.capabilities().hardware_scas_are_enabled {
            self.backend
                .write_parameter(&registers::sca_low(index), roi.low as u32)?;
            self.backend
                .write_parameter(&registers::sca_high(index), roi.high as u32)?;
            if appending {
                self.backend
                    .write_parameter(registers::NUM_SCAS, (index + 1) as u32)?;
            }
        }

        if appending {
            self.channel.rois.push(roi);
        } else {
            self.channel.rois[index] = roi;
        }
        Ok(())
    }

    /// Replace the whole ROI table.
    pub fn set_rois(&mut self, rois: &[Roi]) -> Result<()> {
        if rois.len() > self.channel.max_rois {
            return Err(McaError::InvalidRoi {
                index: rois.len() - 1,
                message: format!("at most {} ROIs are supported", self.channel.max_rois),
            });
        }
        for (index, roi) in rois.iter().enumerate() {
            self.validate_roi(index, *roi)?;
        }

        // local table changes only once the hardware has taken every SCA
        if self.backend.capabilities().hardware_scas_are_enabled {
            for (index, roi) in rois.iter().enumerate() {
                self.backend
                    .write_parameter(&registers::sca_low(index), roi.low as u32)?;
                self.backend
                    .write_parameter(&registers::sca_high(index), roi.high as u32)?;
            }
            self.backend
                .write_parameter(registers::NUM_SCAS, rois.len() as u32)?;
        }

        self.channel.rois = rois.to_vec();
        Ok(())
    }

    /// The ROI table.
    pub fn rois(&self) -> &[Roi] {
        &self.channel.rois
    }

    /// Remove every ROI.
    pub fn clear_rois(&mut self) -> Result<()> {
        if self.backend.capabilities().hardware_scas_are_enabled {
            self.backend.write_parameter(registers::NUM_SCAS, 0)?;
        }
        self.channel.rois.clear();
        Ok(())
    }

    /// ROI `index`.
    pub fn roi(&self, index: usize) -> Result<Roi> {
        self.channel
            .rois
            .get(index)
            .copied()
            .ok_or_else(|| McaError::InvalidRoi {
                index,
                message: format!("only {} ROIs are defined", self.channel.rois.len()),
            })
    }

    fn validate_roi(&self, index: usize, roi: Roi) -> Result<()> {
        if index >= self.channel.max_rois {
            return Err(McaError::InvalidRoi {
                index,
                message: format!("at most {} ROIs are supported", self.channel.max_rois),
            });
        }
        if roi.low > roi.high || roi.high >= self.channel.max_bins {
            return Err(McaError::InvalidRoi {
                index,
                message: format!(
                    "bins {}..={} outside 0..{}",
                    roi.low, roi.high, self.channel.max_bins
                ),
            });
        }
        Ok(())
    }

    /// Sum of ROI `index` over the local spectrum copy.
    pub fn raw_roi_integral(&self, index: usize) -> Result<u64> {
        let roi = self.roi(index)?;
        Ok(derived::raw_integral(self.spectrum(), roi))
    }

    /// Read an integer register.
    pub fn read_parameter(&mut self, name: &str) -> Result<u32> {
        self.backend.read_parameter(name)
    }

    /// Write an integer register on this channel.
    ///
    /// Writing a preset register invalidates the remembered preset.
    pub fn write_parameter(&mut self, name: &str, value: u32) -> Result<()> {
        self.forget_preset_if(name);
        self.backend.write_parameter(name, value)
    }

    /// Write an integer register on every channel of the module.
    pub fn write_parameter_to_all_channels(&mut self, name: &str, value: u32) -> Result<()> {
        self.forget_preset_if(name);
        self.backend.write_parameter_to_all_channels(name, value)
    }

    fn forget_preset_if(&mut self, name: &str) {
        if matches!(
            name,
            registers::PRESET_KIND | registers::PRESET_HIGH | registers::PRESET_LOW
        ) {
            self.last_applied = None;
        }
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(McaError::Unsupported {
                backend: self.backend.backend_name(),
                operation,
            })
        }
    }

    /// Read the baseline history.
    pub fn read_baseline_history(&mut self, buffer: &mut [u32]) -> Result<usize> {
        self.require(self.capabilities().baseline_history, "read_baseline_history")?;
        self.backend.read_baseline_history(buffer)
    }

    /// Adjust the gain by a relative amount.
    pub fn adjust_gain(&mut self, gain_change: f64) -> Result<()> {
        self.require(self.capabilities().gain_adjustment, "adjust_gain")?;
        self.backend.adjust_gain(gain_change)
    }

    /// Read a raw ADC trace.
    pub fn read_adc_trace(&mut self, sample_ns: f64, buffer: &mut [u32]) -> Result<usize> {
        self.require(self.capabilities().adc_trace, "read_adc_trace")?;
        self.backend.read_adc_trace(sample_ns, buffer)
    }

    /// Read a floating-point acquisition value.
    pub fn get_acquisition_value(&mut self, name: &str) -> Result<f64> {
        self.require(self.capabilities().acquisition_values, "get_acquisition_value")?;
        self.backend.get_acquisition_value(name)
    }

    /// Write a floating-point acquisition value.
    pub fn set_acquisition_value(&mut self, name: &str, value: f64) -> Result<()> {
        self.require(self.capabilities().acquisition_values, "set_acquisition_value")?;
        self.backend.set_acquisition_value(name, value)
    }

    /// Measure the tick lengths again and apply them.
    ///
    /// Configured values are not consulted; both ticks are replaced.
    pub fn calibrate_clock(&mut self, settings: &CalibrationSettings) -> Result<ClockTickModel> {
        if self.state != AcquisitionState::Idle {
            return Err(McaError::invalid_config(
                "clock calibration requires an idle channel",
            ));
        }
        let mut run = CalibrationRun {
            backend: &mut self.backend,
        };
        let outcome = ClockTickModel::calibrate_by_measurement(&mut run, settings)?;
        self.clock.apply(&outcome, true);
        self.last_applied = None;
        self.statistics.mark_dirty();
        Ok(self.clock)
    }
}

fn resolve_clock(
    id: &str,
    backend: &mut Box<dyn McaBackend>,
    options: &ControllerOptions,
) -> Result<ClockTickModel> {
    let mut clock = ClockTickModel::default();
    if let Some(seconds) = options.runtime_tick_seconds {
        clock.set_runtime_tick_seconds(seconds)?;
    }
    if let Some(seconds) = options.preset_tick_seconds {
        clock.set_preset_tick_seconds(seconds)?;
    }
    if options.runtime_tick_seconds.is_some() && options.preset_tick_seconds.is_some() {
        return Ok(clock);
    }

    info!(channel = %id, "Tick length not configured, calibrating");
    let mut run = CalibrationRun { backend };
    let outcome = ClockTickModel::calibrate_by_measurement(&mut run, &options.calibration)?;

    let preset_tick = options
        .preset_tick_seconds
        .unwrap_or(outcome.preset_tick_seconds);
    let runtime_tick = options.runtime_tick_seconds.unwrap_or_else(|| {
        outcome
            .runtime_tick_seconds
            .unwrap_or(outcome.preset_tick_seconds)
    });
    ClockTickModel::new(runtime_tick, preset_tick)
}

fn write_preset_registers(
    backend: &mut dyn McaBackend,
    kind: u32,
    words: PresetRegisters,
) -> Result<()> {
    backend.write_parameter_to_all_channels(registers::PRESET_KIND, kind)?;
    backend.write_parameter(registers::PRESET_HIGH, u32::from(words.high))?;
    backend.write_parameter(registers::PRESET_LOW, u32::from(words.low))
}

/// Calibration run over a channel's backend.
struct CalibrationRun<'a> {
    backend: &'a mut Box<dyn McaBackend>,
}

impl TimedRun for CalibrationRun<'_> {
    fn start_timed_run(&mut self, words: PresetRegisters) -> Result<()> {
        write_preset_registers(
            self.backend.as_mut(),
            PresetKind::RealTime.register_value(),
            words,
        )?;
        self.backend.start_run(true)
    }

    fn run_is_busy(&mut self) -> Result<bool> {
        self.backend.is_busy()
    }

    fn finish_timed_run(&mut self) -> Result<Option<u64>> {
        self.backend.stop_run()?;
        self.backend.raw_real_time_ticks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roi_width() {
        assert_eq!(Roi::new(10, 19).width(), 10);
        assert_eq!(Roi::new(5, 5).width(), 1);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_start_retries, 5);
        assert_eq!(policy.busy_poll_interval, Duration::from_millis(10));
        assert_eq!(policy.stop_wait_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_from_toml() {
        let policy: RetryPolicy = toml::from_str("max_start_retries = 2\nbusy_poll_interval_ms = 1")
            .expect("valid policy");
        assert_eq!(policy.max_start_retries, 2);
        assert_eq!(policy.busy_poll_interval, Duration::from_millis(1));
        assert_eq!(policy.stop_wait_timeout, Duration::from_secs(5));
    }
}
