//! Clock-tick timing model for MCA presets and run statistics.
//!
//! The hardware counts time in integer clock ticks. Two independent tick
//! lengths are tracked:
//!
//! - **preset tick**: the unit of the 32-bit preset word, written as two
//!   16-bit registers (`PRESET_HIGH`, `PRESET_LOW`);
//! - **runtime tick**: the unit of the real-time and live-time statistics
//!   counters, which on some firmware is longer than the preset tick.
//!
//! # Preset Encoding
//!
//! ```text
//!   ticks = round(seconds / preset_tick_seconds)
//!
//!   ┌──────────── 32-bit preset word ────────────┐
//!   │  PRESET_HIGH (ticks / 65536) │ PRESET_LOW  │
//!   └──────────────────────────────┴─────────────┘
//! ```
//!
//! # Self-Calibration
//!
//! When no tick length is configured, [`ClockTickModel::calibrate_by_measurement`]
//! runs a short timed acquisition using the provisional 400 ns tick and
//! compares the wall-clock duration with the requested one. The ratio is
//! rounded and clamped to 1 or 2, the only multiples this hardware family
//! supports. Values are measured once and never recomputed automatically.
//!
//! # Example
//!
//! ```
//! use rust_mca::timing::ClockTickModel;
//!
//! let clock = ClockTickModel::default();
//! let regs = clock.to_preset_ticks(10.0).unwrap();
//! assert_eq!((regs.high, regs.low), (381, 23_104));
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{McaError, Result};

/// Provisional tick length used before calibration (400 ns).
pub const DEFAULT_TICK_SECONDS: f64 = 400e-9;

/// Number of distinct values of the 32-bit preset word.
///
/// Some hardware revisions may saturate earlier; this bound is the documented
/// contract and should be checked against real hardware.
pub const PRESET_REGISTER_LIMIT: u64 = 1 << 32;

const WORD_SIZE: u64 = 1 << 16;

/// Tick multiples physically supported by the hardware.
const MIN_TICK_RATIO: u32 = 1;
const MAX_TICK_RATIO: u32 = 2;

/// The two 16-bit halves of the preset word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PresetRegisters {
    /// High-order word (`PRESET_HIGH`)
    pub high: u16,
    /// Low-order word (`PRESET_LOW`)
    pub low: u16,
}

impl PresetRegisters {
    /// Split a total tick count, or `None` if it needs more than 32 bits.
    pub fn from_total(total: u64) -> Option<Self> {
        let high = total / WORD_SIZE;
        if high >= WORD_SIZE {
            return None;
        }
        Some(Self {
            high: high as u16,
            low: (total - WORD_SIZE * high) as u16,
        })
    }

    /// Reassemble the total tick count: `65536 * high + low`.
    pub fn total(&self) -> u64 {
        WORD_SIZE * u64::from(self.high) + u64::from(self.low)
    }
}

/// Converts between seconds and device clock ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockTickModel {
    runtime_tick_seconds: f64,
    preset_tick_seconds: f64,
}

impl Default for ClockTickModel {
    fn default() -> Self {
        Self {
            runtime_tick_seconds: DEFAULT_TICK_SECONDS,
            preset_tick_seconds: DEFAULT_TICK_SECONDS,
        }
    }
}

impl ClockTickModel {
    /// Create a model from known tick lengths.
    pub fn new(runtime_tick_seconds: f64, preset_tick_seconds: f64) -> Result<Self> {
        validate_tick("runtime_tick_seconds", runtime_tick_seconds)?;
        validate_tick("preset_tick_seconds", preset_tick_seconds)?;
        Ok(Self {
            runtime_tick_seconds,
            preset_tick_seconds,
        })
    }

    /// Tick length of the statistics counters in seconds.
    pub fn runtime_tick_seconds(&self) -> f64 {
        self.runtime_tick_seconds
    }

    /// Tick length of the preset word in seconds.
    pub fn preset_tick_seconds(&self) -> f64 {
        self.preset_tick_seconds
    }

    /// Replace the runtime tick length.
    pub fn set_runtime_tick_seconds(&mut self, seconds: f64) -> Result<()> {
        validate_tick("runtime_tick_seconds", seconds)?;
        self.runtime_tick_seconds = seconds;
        Ok(())
    }

    /// Replace the preset tick length.
    pub fn set_preset_tick_seconds(&mut self, seconds: f64) -> Result<()> {
        validate_tick("preset_tick_seconds", seconds)?;
        self.preset_tick_seconds = seconds;
        Ok(())
    }

    /// Longest preset the 32-bit register can hold, in seconds.
    pub fn max_preset_seconds(&self) -> f64 {
        self.preset_tick_seconds * PRESET_REGISTER_LIMIT as f64
    }

    /// Encode a time preset into the two preset registers.
    pub fn to_preset_ticks(&self, seconds: f64) -> Result<PresetRegisters> {
        let max_seconds = self.max_preset_seconds();

        if !seconds.is_finite() || seconds < 0.0 {
            return Err(McaError::Range {
                message: format!("Preset time {} s is not a valid duration", seconds),
                max_seconds,
            });
        }

        let exact = seconds / self.preset_tick_seconds;
        if exact >= PRESET_REGISTER_LIMIT as f64 {
            return Err(McaError::Range {
                message: format!(
                    "Preset time {} s overflows the 32-bit preset register",
                    seconds
                ),
                max_seconds,
            });
        }

        // anything below the limit stays representable after rounding
        let ticks = exact.round().min((PRESET_REGISTER_LIMIT - 1) as f64);
        PresetRegisters::from_total(ticks as u64).ok_or_else(|| McaError::Range {
            message: format!(
                "Preset time {} s overflows the 32-bit preset register",
                seconds
            ),
            max_seconds,
        })
    }

    /// Decode preset registers back into seconds.
    pub fn from_preset_ticks(&self, registers: PresetRegisters) -> f64 {
        registers.total() as f64 * self.preset_tick_seconds
    }

    /// Split an event-count preset without tick conversion.
    pub fn counts_to_registers(count: u64) -> Result<PresetRegisters> {
        PresetRegisters::from_total(count).ok_or_else(|| McaError::Range {
            message: format!(
                "Event count {} overflows the 32-bit preset register (limit {})",
                count, PRESET_REGISTER_LIMIT
            ),
            max_seconds: f64::NAN,
        })
    }

    /// Convert a statistics counter value to seconds.
    pub fn runtime_ticks_to_seconds(&self, ticks: f64) -> f64 {
        ticks * self.runtime_tick_seconds
    }

    /// Measure the preset tick (and optionally the runtime tick) with a short run.
    ///
    /// The model itself is not modified; apply the returned
    /// [`CalibrationOutcome`] with [`ClockTickModel::apply`].
    pub fn calibrate_by_measurement<T>(
        target: &mut T,
        settings: &CalibrationSettings,
    ) -> Result<CalibrationOutcome>
    where
        T: TimedRun + ?Sized,
    {
        let provisional = Self::default();
        let registers = provisional.to_preset_ticks(settings.target_seconds)?;
        let timeout = Duration::try_from_secs_f64(settings.timeout_seconds).map_err(|e| {
            McaError::invalid_config(format!(
                "Calibration timeout {} s: {}",
                settings.timeout_seconds, e
            ))
        })?;

        debug!(
            target_seconds = settings.target_seconds,
            ticks = registers.total(),
            "Starting clock calibration run"
        );

        let started = Instant::now();
        target.start_timed_run(registers)?;

        loop {
            if !target.run_is_busy()? {
                break;
            }
            if started.elapsed() >= timeout {
                if let Err(e) = target.finish_timed_run() {
                    warn!(error = %e, "Failed to stop calibration run after timeout");
                }
                return Err(McaError::TimedOut {
                    operation: "clock calibration".to_string(),
                    seconds: settings.timeout_seconds,
                });
            }
            std::thread::sleep(settings.poll_interval);
        }

        let elapsed = started.elapsed();
        let raw_real_time = target.finish_timed_run()?;

        let actual = elapsed.as_secs_f64();
        let ratio = tick_ratio(actual, settings.target_seconds);
        let preset_tick_seconds = DEFAULT_TICK_SECONDS * f64::from(ratio);

        let runtime_tick_seconds = match raw_real_time {
            Some(ticks) if ticks > 0 => {
                let estimate = actual / ticks as f64;
                Some(DEFAULT_TICK_SECONDS * f64::from(tick_ratio(estimate, DEFAULT_TICK_SECONDS)))
            }
            _ => None,
        };

        info!(
            elapsed_s = actual,
            ratio,
            preset_tick_ns = preset_tick_seconds * 1e9,
            "Clock calibration complete"
        );

        Ok(CalibrationOutcome {
            elapsed,
            ratio,
            preset_tick_seconds,
            runtime_tick_seconds,
        })
    }

    /// Apply a calibration result.
    ///
    /// The preset tick is always taken. The runtime tick is taken only when
    /// `update_runtime` is set; it falls back to the measured preset tick if
    /// the backend could not report raw real-time ticks.
    pub fn apply(&mut self, outcome: &CalibrationOutcome, update_runtime: bool) {
        self.preset_tick_seconds = outcome.preset_tick_seconds;
        if update_runtime {
            self.runtime_tick_seconds = outcome
                .runtime_tick_seconds
                .unwrap_or(outcome.preset_tick_seconds);
        }
    }
}

fn validate_tick(name: &str, seconds: f64) -> Result<()> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(McaError::invalid_config(format!(
            "{} must be positive, got {}",
            name, seconds
        )));
    }
    Ok(())
}

/// Ratio of measured to requested duration, rounded and clamped to {1, 2}.
pub fn tick_ratio(actual_seconds: f64, target_seconds: f64) -> u32 {
    if target_seconds.is_nan() || target_seconds <= 0.0 || !actual_seconds.is_finite() {
        return MIN_TICK_RATIO;
    }
    let ratio = (actual_seconds / target_seconds).round();
    ratio.clamp(f64::from(MIN_TICK_RATIO), f64::from(MAX_TICK_RATIO)) as u32
}

/// Something that can run a short timed acquisition for calibration.
pub trait TimedRun {
    /// Program the preset registers (real-time preset) and start a run.
    fn start_timed_run(&mut self, registers: PresetRegisters) -> Result<()>;

    /// Report whether the run is still active.
    fn run_is_busy(&mut self) -> Result<bool>;

    /// Stop the run and report the raw real-time tick count, if known.
    fn finish_timed_run(&mut self) -> Result<Option<u64>>;
}

/// Parameters of the calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// Requested run length in seconds
    pub target_seconds: f64,
    /// Deadline for the run to finish
    pub timeout_seconds: f64,
    /// Sleep between busy polls
    pub poll_interval: Duration,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            target_seconds: 0.1,
            timeout_seconds: 10.0,
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// Result of a calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutcome {
    /// Measured wall-clock duration
    pub elapsed: Duration,
    /// Clamped tick multiple
    pub ratio: u32,
    /// Measured preset tick length
    pub preset_tick_seconds: f64,
    /// Measured runtime tick length, if raw counters were available
    pub runtime_tick_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run that stays busy for a fixed wall-clock duration.
    struct FakeRun {
        duration: Duration,
        started: Option<Instant>,
        raw_ticks: Option<u64>,
        finished: u32,
    }

    impl FakeRun {
        fn new(duration: Duration) -> Self {
            Self {
                duration,
                started: None,
                raw_ticks: None,
                finished: 0,
            }
        }
    }

    impl TimedRun for FakeRun {
        fn start_timed_run(&mut self, registers: PresetRegisters) -> Result<()> {
            assert_eq!(registers.total(), 250_000);
            self.started = Some(Instant::now());
            Ok(())
        }

        fn run_is_busy(&mut self) -> Result<bool> {
            Ok(self
                .started
                .map(|s| s.elapsed() < self.duration)
                .unwrap_or(false))
        }

        fn finish_timed_run(&mut self) -> Result<Option<u64>> {
            self.finished += 1;
            Ok(self.raw_ticks)
        }
    }

    #[test]
    fn test_register_split() {
        let regs = PresetRegisters::from_total(25_000_000).unwrap();
        assert_eq!(regs.high, 381);
        assert_eq!(regs.low, 23_104);
        assert_eq!(regs.total(), 25_000_000);
        assert!(PresetRegisters::from_total(PRESET_REGISTER_LIMIT).is_none());
        assert!(PresetRegisters::from_total(PRESET_REGISTER_LIMIT - 1).is_some());
    }

    #[test]
    fn test_round_trip_within_one_tick() {
        let clock = ClockTickModel::default();
        let tick = clock.preset_tick_seconds();
        let max = tick * (PRESET_REGISTER_LIMIT - 1) as f64;

        for seconds in [0.0, tick, 0.5, 1.0, 10.0, 123.456, 1000.0, max / 2.0, max] {
            let regs = clock.to_preset_ticks(seconds).unwrap();
            let exact = seconds / tick;
            assert!(
                (regs.total() as f64 - exact).abs() <= 1.0,
                "seconds={} total={} exact={}",
                seconds,
                regs.total(),
                exact
            );
            assert!((clock.from_preset_ticks(regs) - seconds).abs() <= tick);
        }
    }

    #[test]
    fn test_overflow_reports_max_seconds() {
        let clock = ClockTickModel::default();
        let limit = clock.max_preset_seconds();

        for seconds in [limit, limit * 1.5, 1.0e6] {
            match clock.to_preset_ticks(seconds) {
                Err(McaError::Range { max_seconds, .. }) => {
                    assert!((max_seconds - limit).abs() < 1e-9);
                }
                other => panic!("expected range error, got {:?}", other),
            }
        }

        let err = clock.to_preset_ticks(limit).unwrap_err();
        assert!(err.to_string().contains(&limit.to_string()));
    }

    #[test]
    fn test_just_below_limit_is_accepted() {
        let clock = ClockTickModel::default();
        let limit = clock.max_preset_seconds();

        // rounds to 2^32 ticks, still under the documented maximum
        let seconds = 1717.98691828;
        assert!(seconds < limit);
        let regs = clock.to_preset_ticks(seconds).unwrap();
        assert_eq!(regs.total(), PRESET_REGISTER_LIMIT - 1);
        assert_eq!(regs.high, u16::MAX);
        assert_eq!(regs.low, u16::MAX);

        assert!(clock.to_preset_ticks(limit).is_err());
    }

    #[test]
    fn test_invalid_durations_rejected() {
        let clock = ClockTickModel::default();
        assert!(clock.to_preset_ticks(-1.0).is_err());
        assert!(clock.to_preset_ticks(f64::NAN).is_err());
        assert!(ClockTickModel::new(0.0, 400e-9).is_err());
        assert!(ClockTickModel::new(400e-9, -1.0).is_err());
    }

    #[test]
    fn test_count_split_limit() {
        assert!(ClockTickModel::counts_to_registers(PRESET_REGISTER_LIMIT - 1).is_ok());
        assert!(ClockTickModel::counts_to_registers(PRESET_REGISTER_LIMIT).is_err());
    }

    #[test]
    fn test_tick_ratio() {
        assert_eq!(tick_ratio(0.21, 0.1), 2);
        assert_eq!(tick_ratio(0.1, 0.1), 1);
        assert_eq!(tick_ratio(0.04, 0.1), 1);
        assert_eq!(tick_ratio(0.9, 0.1), 2);
        assert_eq!(tick_ratio(0.1, 0.0), 1);
    }

    #[test]
    fn test_calibration_doubles_tick() {
        let mut run = FakeRun::new(Duration::from_millis(210));
        let settings = CalibrationSettings::default();

        let outcome = ClockTickModel::calibrate_by_measurement(&mut run, &settings).unwrap();
        assert_eq!(outcome.ratio, 2);
        assert!((outcome.preset_tick_seconds - 800e-9).abs() < 1e-15);
        assert_eq!(outcome.runtime_tick_seconds, None);
        assert_eq!(run.finished, 1);

        let mut clock = ClockTickModel::default();
        clock.apply(&outcome, true);
        assert!((clock.preset_tick_seconds() - 800e-9).abs() < 1e-15);
        assert!((clock.runtime_tick_seconds() - 800e-9).abs() < 1e-15);
    }

    #[test]
    fn test_calibration_derives_runtime_tick() {
        let mut run = FakeRun::new(Duration::from_millis(100));
        // 0.1 s worth of 800 ns runtime ticks
        run.raw_ticks = Some(125_000);

        let outcome =
            ClockTickModel::calibrate_by_measurement(&mut run, &CalibrationSettings::default())
                .unwrap();
        assert_eq!(outcome.ratio, 1);
        assert!((outcome.runtime_tick_seconds.unwrap() - 800e-9).abs() < 1e-15);

        let mut clock = ClockTickModel::default();
        clock.apply(&outcome, false);
        assert!((clock.runtime_tick_seconds() - DEFAULT_TICK_SECONDS).abs() < 1e-15);
    }

    #[test]
    fn test_calibration_times_out() {
        let mut run = FakeRun::new(Duration::from_secs(3600));
        let settings = CalibrationSettings {
            timeout_seconds: 0.05,
            ..Default::default()
        };

        let err = ClockTickModel::calibrate_by_measurement(&mut run, &settings).unwrap_err();
        assert!(err.is_timed_out());
        assert_eq!(run.finished, 1);
    }

    #[test]
    fn test_unrepresentable_timeout_is_config_error() {
        let mut run = FakeRun::new(Duration::from_millis(10));
        let settings = CalibrationSettings {
            timeout_seconds: 1e30,
            ..Default::default()
        };

        let err = ClockTickModel::calibrate_by_measurement(&mut run, &settings).unwrap_err();
        assert!(matches!(err, McaError::InvalidConfig { .. }));
        assert!(run.started.is_none());
    }
}
