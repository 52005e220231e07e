//! Simulated MCA hardware for mock channels and tests.
//!
//! [`SimulatedHardware`] models a rack of modules with a fixed number of
//! channels each. Runs progress on the wall clock with the hardware's own
//! tick lengths, which may differ from what the controller assumes, so clock
//! calibration has something real to measure. The two vendor library traits
//! are implemented on thin addressing wrappers that share one hardware model.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::detector_library::DetectorLibrary;
use super::module_library::ModuleLibrary;
use super::{registers, NativeResult, NativeStatistics};
use crate::preset::PresetKind;
use crate::timing::DEFAULT_TICK_SECONDS;

/// Channel or module index out of range
pub const SIM_BAD_CHANNEL: i32 = -2;
/// Unknown register or acquisition value name
pub const SIM_UNKNOWN_PARAMETER: i32 = -3;
/// Value rejected by the firmware
pub const SIM_BAD_VALUE: i32 = -4;
/// A run is already active on the channel
pub const SIM_RUN_ACTIVE: i32 = -7;

fn default_modules() -> u32 {
    1
}

fn default_channels_per_module() -> u32 {
    4
}

fn default_bins() -> usize {
    2048
}

fn default_tick() -> f64 {
    DEFAULT_TICK_SECONDS
}

fn default_input_count_rate() -> f64 {
    50_000.0
}

fn default_dead_time_fraction() -> f64 {
    0.1
}

fn default_report_overflows() -> bool {
    true
}

/// Shape of the simulated hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorSettings {
    /// Number of modules
    #[serde(default = "default_modules")]
    pub modules: u32,
    /// Channels in each module
    #[serde(default = "default_channels_per_module")]
    pub channels_per_module: u32,
    /// Maximum spectrum bins per channel
    #[serde(default = "default_bins")]
    pub bins: usize,
    /// True runtime tick of the hardware clock
    #[serde(default = "default_tick")]
    pub runtime_tick_seconds: f64,
    /// True preset tick of the hardware clock
    #[serde(default = "default_tick")]
    pub preset_tick_seconds: f64,
    /// Simulated input count rate in counts/s
    #[serde(default = "default_input_count_rate")]
    pub input_count_rate: f64,
    /// Fraction of real time lost to dead time
    #[serde(default = "default_dead_time_fraction")]
    pub dead_time_fraction: f64,
    /// Whether underflow/overflow counters exist in firmware
    #[serde(default = "default_report_overflows")]
    pub report_overflows: bool,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            modules: default_modules(),
            channels_per_module: default_channels_per_module(),
            bins: default_bins(),
            runtime_tick_seconds: default_tick(),
            preset_tick_seconds: default_tick(),
            input_count_rate: default_input_count_rate(),
            dead_time_fraction: default_dead_time_fraction(),
            report_overflows: default_report_overflows(),
        }
    }
}

impl SimulatorSettings {
    fn output_count_rate(&self) -> f64 {
        self.input_count_rate * (1.0 - self.dead_time_fraction)
    }
}

/// One register write seen by the simulated hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterWrite {
    /// Flat channel index
    pub channel: usize,
    /// Register name
    pub name: String,
    /// Value written
    pub value: u32,
}

#[derive(Debug, Clone)]
struct SimRun {
    started: Instant,
    limit_seconds: Option<f64>,
}

#[derive(Debug, Clone)]
struct SimChannel {
    params: HashMap<String, u32>,
    values: HashMap<String, f64>,
    gain: f64,
    accumulated_real: f64,
    run: Option<SimRun>,
}

impl SimChannel {
    fn new(bins: usize) -> Self {
        let mut params = HashMap::new();
        params.insert(registers::PRESET_KIND.to_string(), 0);
        params.insert(registers::PRESET_HIGH.to_string(), 0);
        params.insert(registers::PRESET_LOW.to_string(), 0);
        params.insert(registers::NUM_SCAS.to_string(), 0);
        params.insert(registers::MCA_BINS.to_string(), bins as u32);
        params.insert("PEAKINT".to_string(), 400);
        params.insert("THRESHOLD".to_string(), 20);

        let mut values = HashMap::new();
        values.insert("peaking_time".to_string(), 4.0);
        values.insert("dynamic_range".to_string(), 47_200.0);
        values.insert("calibration_energy".to_string(), 5_900.0);

        Self {
            params,
            values,
            gain: 1.0,
            accumulated_real: 0.0,
            run: None,
        }
    }

    fn run_elapsed(&self, now: Instant) -> f64 {
        match &self.run {
            Some(run) => {
                let elapsed = now.duration_since(run.started).as_secs_f64();
                match run.limit_seconds {
                    Some(limit) => elapsed.min(limit),
                    None => elapsed,
                }
            }
            None => 0.0,
        }
    }

    fn real_seconds(&self, now: Instant) -> f64 {
        self.accumulated_real + self.run_elapsed(now)
    }

    fn counting(&self, now: Instant) -> bool {
        match &self.run {
            Some(run) => match run.limit_seconds {
                Some(limit) => now.duration_since(run.started).as_secs_f64() < limit,
                None => true,
            },
            None => false,
        }
    }

    fn param(&self, name: &str) -> u32 {
        self.params.get(name).copied().unwrap_or(0)
    }
}

/// Simulated rack of MCA modules.
#[derive(Debug)]
pub struct SimulatedHardware {
    settings: SimulatorSettings,
    channels: Vec<SimChannel>,
    pending_start_errors: VecDeque<i32>,
    write_log: Vec<ParameterWrite>,
}

impl SimulatedHardware {
    /// Build the hardware with every channel idle and cleared.
    pub fn new(settings: SimulatorSettings) -> Self {
        let count = (settings.modules * settings.channels_per_module) as usize;
        let channels = (0..count).map(|_| SimChannel::new(settings.bins)).collect();
        Self {
            settings,
            channels,
            pending_start_errors: VecDeque::new(),
            write_log: Vec::new(),
        }
    }

    /// Build the hardware behind a shared lock.
    pub fn shared(settings: SimulatorSettings) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(settings)))
    }

    /// Hardware shape.
    pub fn settings(&self) -> &SimulatorSettings {
        &self.settings
    }

    /// Total number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Make the next `count` start requests fail with `code`.
    pub fn inject_start_errors(&mut self, code: i32, count: usize) {
        self.pending_start_errors
            .extend(std::iter::repeat(code).take(count));
    }

    /// Leave the run-enable state set on `channel` without counting.
    ///
    /// Models a run that ended on its preset and was never stopped.
    pub fn leave_run_enabled(&mut self, channel: usize) -> NativeResult<()> {
        let now = Instant::now();
        let ch = self.channel_mut(channel)?;
        ch.run = Some(SimRun {
            started: now,
            limit_seconds: Some(0.0),
        });
        Ok(())
    }

    /// Every register write so far, oldest first.
    pub fn write_log(&self) -> &[ParameterWrite] {
        &self.write_log
    }

    /// Forget recorded register writes.
    pub fn clear_write_log(&mut self) {
        self.write_log.clear();
    }

    /// True while the run-enable state is set, counting or not.
    pub fn run_enabled(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .map(|ch| ch.run.is_some())
            .unwrap_or(false)
    }

    /// Module index of `channel`.
    pub fn module_of(&self, channel: usize) -> usize {
        channel / self.settings.channels_per_module.max(1) as usize
    }

    /// Flat indices of every channel in `module`.
    pub fn module_channels(&self, module: usize) -> NativeResult<Vec<usize>> {
        if module >= self.settings.modules as usize {
            return Err(SIM_BAD_CHANNEL);
        }
        let per = self.settings.channels_per_module as usize;
        Ok((module * per..(module + 1) * per).collect())
    }

    fn channel(&self, channel: usize) -> NativeResult<&SimChannel> {
        self.channels.get(channel).ok_or(SIM_BAD_CHANNEL)
    }

    fn channel_mut(&mut self, channel: usize) -> NativeResult<&mut SimChannel> {
        self.channels.get_mut(channel).ok_or(SIM_BAD_CHANNEL)
    }

    /// Read a register.
    pub fn read_param(&self, channel: usize, name: &str) -> NativeResult<u32> {
        self.channel(channel)?
            .params
            .get(name)
            .copied()
            .ok_or(SIM_UNKNOWN_PARAMETER)
    }

    /// Write a register.
    pub fn write_param(&mut self, channel: usize, name: &str, value: u32) -> NativeResult<()> {
        if name == registers::MCA_BINS && (value == 0 || value as usize > self.settings.bins) {
            return Err(SIM_BAD_VALUE);
        }
        self.channel_mut(channel)?
            .params
            .insert(name.to_string(), value);
        self.write_log.push(ParameterWrite {
            channel,
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    /// Start counting with the programmed preset.
    pub fn start_run(&mut self, channel: usize, clear: bool) -> NativeResult<()> {
        self.channel(channel)?;
        if let Some(code) = self.pending_start_errors.pop_front() {
            return Err(code);
        }

        let limit_seconds = self.preset_limit(channel)?;
        let now = Instant::now();
        let ch = self.channel_mut(channel)?;
        if ch.run.is_some() {
            return Err(SIM_RUN_ACTIVE);
        }
        if clear {
            ch.accumulated_real = 0.0;
        }
        ch.run = Some(SimRun {
            started: now,
            limit_seconds,
        });
        Ok(())
    }

    fn preset_limit(&self, channel: usize) -> NativeResult<Option<f64>> {
        let ch = self.channel(channel)?;
        let total = (u64::from(ch.param(registers::PRESET_HIGH)) << 16)
            | u64::from(ch.param(registers::PRESET_LOW));
        let total = total as f64;
        let s = &self.settings;

        let kind = PresetKind::from_register(ch.param(registers::PRESET_KIND)).ok_or(SIM_BAD_VALUE)?;
        Ok(match kind {
            PresetKind::None => None,
            PresetKind::RealTime => Some(total * s.preset_tick_seconds),
            PresetKind::LiveTime => {
                Some(total * s.preset_tick_seconds / (1.0 - s.dead_time_fraction))
            }
            PresetKind::OutputEvents => Some(total / s.output_count_rate()),
            PresetKind::InputCounts => Some(total / s.input_count_rate),
        })
    }

    /// Stop counting and clear the run-enable state.
    pub fn stop_run(&mut self, channel: usize) -> NativeResult<()> {
        let now = Instant::now();
        let ch = self.channel_mut(channel)?;
        ch.accumulated_real = ch.real_seconds(now);
        ch.run = None;
        Ok(())
    }

    /// Zero the accumulated spectrum and counters; a running run keeps going.
    pub fn clear(&mut self, channel: usize) -> NativeResult<()> {
        let now = Instant::now();
        let ch = self.channel_mut(channel)?;
        ch.accumulated_real = 0.0;
        if let Some(run) = ch.run.as_mut() {
            if let Some(limit) = run.limit_seconds.as_mut() {
                let elapsed = now.duration_since(run.started).as_secs_f64();
                *limit = (*limit - elapsed).max(0.0);
            }
            run.started = now;
        }
        Ok(())
    }

    /// True while the channel is counting.
    pub fn is_busy(&self, channel: usize) -> NativeResult<bool> {
        Ok(self.channel(channel)?.counting(Instant::now()))
    }

    /// Counters of the current or last run.
    pub fn read_statistics(&self, channel: usize) -> NativeResult<NativeStatistics> {
        let ch = self.channel(channel)?;
        let s = &self.settings;
        let real = ch.real_seconds(Instant::now());
        let live = real * (1.0 - s.dead_time_fraction);
        let events = (s.output_count_rate() * real).round() as u64;
        let (underflows, overflows) = if s.report_overflows {
            (Some(events / 1000), Some(events / 2000))
        } else {
            (None, None)
        };

        Ok(NativeStatistics {
            real_time_ticks: (real / s.runtime_tick_seconds).round() as u64,
            live_time_ticks: (live / s.runtime_tick_seconds).round() as u64,
            input_count_rate: s.input_count_rate,
            output_count_rate: s.output_count_rate(),
            fast_peaks: (s.input_count_rate * real).round() as u64,
            events,
            underflows,
            overflows,
        })
    }

    /// Fill `buffer` with the accumulated spectrum: two gaussian lines.
    pub fn read_spectrum(&self, channel: usize, buffer: &mut [u32]) -> NativeResult<usize> {
        let ch = self.channel(channel)?;
        let bins = (ch.param(registers::MCA_BINS) as usize).min(buffer.len());
        let events = self.settings.output_count_rate() * ch.real_seconds(Instant::now());
        let width = bins as f64 * 0.01 + 1.0;
        let lines = [(0.3 * ch.gain, 0.6), (0.65 * ch.gain, 0.4)];

        for (i, bin) in buffer.iter_mut().take(bins).enumerate() {
            let x = i as f64;
            let weight: f64 = lines
                .iter()
                .map(|(position, fraction)| {
                    let centre = position * bins as f64;
                    fraction * (-(x - centre).powi(2) / (2.0 * width * width)).exp()
                        / (width * (2.0 * PI).sqrt())
                })
                .sum();
            *bin = (events * weight).round() as u32;
        }
        Ok(bins)
    }

    /// Fill `buffer` with baseline samples.
    pub fn read_baseline_history(&self, channel: usize, buffer: &mut [u32]) -> NativeResult<usize> {
        self.channel(channel)?;
        for (i, sample) in buffer.iter_mut().enumerate() {
            *sample = 1000 + (i % 16) as u32;
        }
        Ok(buffer.len())
    }

    /// Fill `buffer` with an ADC trace sampled every `sample_ns`.
    pub fn read_adc_trace(
        &self,
        channel: usize,
        sample_ns: f64,
        buffer: &mut [u32],
    ) -> NativeResult<usize> {
        self.channel(channel)?;
        if sample_ns.is_nan() || sample_ns <= 0.0 {
            return Err(SIM_BAD_VALUE);
        }
        for (i, sample) in buffer.iter_mut().enumerate() {
            let phase = i as f64 * sample_ns * 1e-3;
            *sample = (2048.0 + 512.0 * phase.sin()).round() as u32;
        }
        Ok(buffer.len())
    }

    /// Scale the gain by `1 + gain_change`.
    pub fn adjust_gain(&mut self, channel: usize, gain_change: f64) -> NativeResult<()> {
        let gain = self.channel(channel)?.gain * (1.0 + gain_change);
        if !gain.is_finite() || gain <= 0.0 {
            return Err(SIM_BAD_VALUE);
        }
        self.channel_mut(channel)?.gain = gain;
        Ok(())
    }

    /// Current gain multiplier.
    pub fn gain(&self, channel: usize) -> NativeResult<f64> {
        Ok(self.channel(channel)?.gain)
    }

    /// Read a floating-point acquisition value.
    pub fn get_value(&self, channel: usize, name: &str) -> NativeResult<f64> {
        self.channel(channel)?
            .values
            .get(name)
            .copied()
            .ok_or(SIM_UNKNOWN_PARAMETER)
    }

    /// Write a floating-point acquisition value.
    pub fn set_value(&mut self, channel: usize, name: &str, value: f64) -> NativeResult<()> {
        if !value.is_finite() {
            return Err(SIM_BAD_VALUE);
        }
        self.channel_mut(channel)?
            .values
            .insert(name.to_string(), value);
        Ok(())
    }
}

/// Vendor text for a simulator status code.
pub fn error_text(code: i32) -> String {
    match code {
        SIM_BAD_CHANNEL => "channel out of range".to_string(),
        SIM_UNKNOWN_PARAMETER => "unknown parameter".to_string(),
        SIM_BAD_VALUE => "value out of range".to_string(),
        SIM_RUN_ACTIVE => "run already active".to_string(),
        other => format!("unknown status {}", other),
    }
}

/// [`ModuleLibrary`] over simulated hardware.
#[derive(Debug, Clone)]
pub struct SimulatedModuleLibrary {
    hardware: Arc<Mutex<SimulatedHardware>>,
}

impl SimulatedModuleLibrary {
    /// Wrap shared hardware.
    pub fn new(hardware: Arc<Mutex<SimulatedHardware>>) -> Self {
        Self { hardware }
    }

    /// Shared hardware handle.
    pub fn hardware(&self) -> &Arc<Mutex<SimulatedHardware>> {
        &self.hardware
    }

    fn flat(&self, module: u32, sub_channel: u32) -> NativeResult<usize> {
        let hw = self.hardware.lock();
        let s = hw.settings();
        if module >= s.modules || sub_channel >= s.channels_per_module {
            return Err(SIM_BAD_CHANNEL);
        }
        Ok((module * s.channels_per_module + sub_channel) as usize)
    }
}

impl ModuleLibrary for SimulatedModuleLibrary {
    fn channels_in_module(&self, module: u32) -> NativeResult<u32> {
        let hw = self.hardware.lock();
        if module >= hw.settings().modules {
            return Err(SIM_BAD_CHANNEL);
        }
        Ok(hw.settings().channels_per_module)
    }

    fn read_parameter(&self, module: u32, sub_channel: u32, name: &str) -> NativeResult<u32> {
        let ch = self.flat(module, sub_channel)?;
        self.hardware.lock().read_param(ch, name)
    }

    fn write_parameter(
        &self,
        module: u32,
        sub_channel: u32,
        name: &str,
        value: u32,
    ) -> NativeResult<()> {
        let ch = self.flat(module, sub_channel)?;
        self.hardware.lock().write_param(ch, name, value)
    }

    fn start_run(&self, module: u32, sub_channel: u32, clear: bool) -> NativeResult<()> {
        let ch = self.flat(module, sub_channel)?;
        self.hardware.lock().start_run(ch, clear)
    }

    fn stop_run(&self, module: u32, sub_channel: u32) -> NativeResult<()> {
        let ch = self.flat(module, sub_channel)?;
        self.hardware.lock().stop_run(ch)
    }

    fn run_status(&self, module: u32, sub_channel: u32) -> NativeResult<bool> {
        let ch = self.flat(module, sub_channel)?;
        self.hardware.lock().is_busy(ch)
    }

    fn read_spectrum(&self, module: u32, sub_channel: u32, buffer: &mut [u32]) -> NativeResult<usize> {
        let ch = self.flat(module, sub_channel)?;
        self.hardware.lock().read_spectrum(ch, buffer)
    }

    fn read_statistics(&self, module: u32, sub_channel: u32) -> NativeResult<NativeStatistics> {
        let ch = self.flat(module, sub_channel)?;
        self.hardware.lock().read_statistics(ch)
    }

    fn read_baseline_history(
        &self,
        module: u32,
        sub_channel: u32,
        buffer: &mut [u32],
    ) -> NativeResult<usize> {
        let ch = self.flat(module, sub_channel)?;
        self.hardware.lock().read_baseline_history(ch, buffer)
    }

    fn read_adc_trace(
        &self,
        module: u32,
        sub_channel: u32,
        sample_ns: f64,
        buffer: &mut [u32],
    ) -> NativeResult<usize> {
        let ch = self.flat(module, sub_channel)?;
        self.hardware.lock().read_adc_trace(ch, sample_ns, buffer)
    }

    fn run_active_code(&self) -> Option<i32> {
        Some(SIM_RUN_ACTIVE)
    }

    fn error_text(&self, code: i32) -> String {
        error_text(code)
    }
}

/// [`DetectorLibrary`] over simulated hardware.
#[derive(Debug, Clone)]
pub struct SimulatedDetectorLibrary {
    hardware: Arc<Mutex<SimulatedHardware>>,
}

impl SimulatedDetectorLibrary {
    /// Wrap shared hardware.
    pub fn new(hardware: Arc<Mutex<SimulatedHardware>>) -> Self {
        Self { hardware }
    }

    /// Shared hardware handle.
    pub fn hardware(&self) -> &Arc<Mutex<SimulatedHardware>> {
        &self.hardware
    }
}

impl DetectorLibrary for SimulatedDetectorLibrary {
    fn module_channels(&self, detector_channel: u32) -> NativeResult<Vec<u32>> {
        let hw = self.hardware.lock();
        let ch = detector_channel as usize;
        if ch >= hw.channel_count() {
            return Err(SIM_BAD_CHANNEL);
        }
        let channels = hw.module_channels(hw.module_of(ch))?;
        Ok(channels.into_iter().map(|c| c as u32).collect())
    }

    fn get_parameter(&self, detector_channel: u32, name: &str) -> NativeResult<u32> {
        self.hardware
            .lock()
            .read_param(detector_channel as usize, name)
    }

    fn set_parameter(&self, detector_channel: u32, name: &str, value: u32) -> NativeResult<()> {
        self.hardware
            .lock()
            .write_param(detector_channel as usize, name, value)
    }

    fn start_run(&self, detector_channel: u32, clear: bool) -> NativeResult<()> {
        self.hardware
            .lock()
            .start_run(detector_channel as usize, clear)
    }

    fn stop_run(&self, detector_channel: u32) -> NativeResult<()> {
        self.hardware.lock().stop_run(detector_channel as usize)
    }

    fn is_running(&self, detector_channel: u32) -> NativeResult<bool> {
        self.hardware.lock().is_busy(detector_channel as usize)
    }

    fn read_spectrum(&self, detector_channel: u32, buffer: &mut [u32]) -> NativeResult<usize> {
        self.hardware
            .lock()
            .read_spectrum(detector_channel as usize, buffer)
    }

    fn read_statistics(&self, detector_channel: u32) -> NativeResult<NativeStatistics> {
        self.hardware
            .lock()
            .read_statistics(detector_channel as usize)
    }

    fn read_baseline_history(&self, detector_channel: u32, buffer: &mut [u32]) -> NativeResult<usize> {
        self.hardware
            .lock()
            .read_baseline_history(detector_channel as usize, buffer)
    }

    fn read_adc_trace(
        &self,
        detector_channel: u32,
        sample_ns: f64,
        buffer: &mut [u32],
    ) -> NativeResult<usize> {
        self.hardware
            .lock()
            .read_adc_trace(detector_channel as usize, sample_ns, buffer)
    }

    fn get_acquisition_value(&self, detector_channel: u32, name: &str) -> NativeResult<f64> {
        self.hardware
            .lock()
            .get_value(detector_channel as usize, name)
    }

    fn set_acquisition_value(&self, detector_channel: u32, name: &str, value: f64) -> NativeResult<()> {
        self.hardware
            .lock()
            .set_value(detector_channel as usize, name, value)
    }

    fn adjust_gain(&self, detector_channel: u32, gain_change: f64) -> NativeResult<()> {
        self.hardware
            .lock()
            .adjust_gain(detector_channel as usize, gain_change)
    }

    fn run_active_code(&self) -> Option<i32> {
        Some(SIM_RUN_ACTIVE)
    }

    fn error_text(&self, code: i32) -> String {
        error_text(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_real_time(hw: &mut SimulatedHardware, channel: usize, ticks: u32) {
        hw.write_param(channel, registers::PRESET_KIND, 1).unwrap();
        hw.write_param(channel, registers::PRESET_HIGH, ticks >> 16).unwrap();
        hw.write_param(channel, registers::PRESET_LOW, ticks & 0xFFFF).unwrap();
    }

    #[test]
    fn test_run_ends_on_preset_but_stays_enabled() {
        let mut hw = SimulatedHardware::new(SimulatorSettings::default());
        program_real_time(&mut hw, 0, 0);
        hw.start_run(0, true).unwrap();

        assert!(!hw.is_busy(0).unwrap());
        assert!(hw.run_enabled(0));
        assert_eq!(hw.start_run(0, true), Err(SIM_RUN_ACTIVE));

        hw.stop_run(0).unwrap();
        assert!(!hw.run_enabled(0));
        hw.start_run(0, true).unwrap();
    }

    #[test]
    fn test_injected_start_errors_are_consumed() {
        let mut hw = SimulatedHardware::new(SimulatorSettings::default());
        hw.inject_start_errors(SIM_RUN_ACTIVE, 2);
        assert_eq!(hw.start_run(1, true), Err(SIM_RUN_ACTIVE));
        assert_eq!(hw.start_run(1, true), Err(SIM_RUN_ACTIVE));
        assert!(hw.start_run(1, true).is_ok());
    }

    #[test]
    fn test_write_log_and_bin_limit() {
        let mut hw = SimulatedHardware::new(SimulatorSettings::default());
        hw.write_param(2, "PEAKINT", 800).unwrap();
        assert_eq!(hw.read_param(2, "PEAKINT"), Ok(800));
        assert_eq!(hw.write_log().len(), 1);
        assert_eq!(hw.write_param(2, registers::MCA_BINS, 1 << 20), Err(SIM_BAD_VALUE));
        assert_eq!(hw.read_param(2, "NOPE"), Err(SIM_UNKNOWN_PARAMETER));
    }

    #[test]
    fn test_module_addressing() {
        let hw = SimulatedHardware::shared(SimulatorSettings {
            modules: 2,
            ..Default::default()
        });
        let modules = SimulatedModuleLibrary::new(hw.clone());
        let detectors = SimulatedDetectorLibrary::new(hw);

        assert_eq!(modules.channels_in_module(1), Ok(4));
        assert_eq!(modules.channels_in_module(2), Err(SIM_BAD_CHANNEL));
        assert_eq!(detectors.module_channels(5), Ok(vec![4, 5, 6, 7]));

        modules.write_parameter(1, 2, "THRESHOLD", 33).unwrap();
        assert_eq!(detectors.get_parameter(6, "THRESHOLD"), Ok(33));
    }

    #[test]
    fn test_spectrum_scales_with_gain() {
        let mut hw = SimulatedHardware::new(SimulatorSettings::default());
        hw.adjust_gain(0, 0.5).unwrap();
        assert!((hw.gain(0).unwrap() - 1.5).abs() < 1e-12);
        assert_eq!(hw.adjust_gain(0, -1.0), Err(SIM_BAD_VALUE));

        let mut buffer = vec![0u32; 4096];
        assert_eq!(hw.read_spectrum(0, &mut buffer), Ok(2048));
    }

    #[test]
    fn test_missing_overflow_counters() {
        let hw = SimulatedHardware::new(SimulatorSettings {
            report_overflows: false,
            ..Default::default()
        });
        let stats = hw.read_statistics(0).unwrap();
        assert_eq!(stats.underflows, None);
        assert_eq!(stats.overflows, None);
    }
}
