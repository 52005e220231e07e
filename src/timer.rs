//! MCA channel exposed as a "count for N seconds" timer.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::controller::AcquisitionController;
use crate::error::{McaError, Result};
use crate::preset::{PresetKind, PresetSpec};
use crate::statistics::RunStatistics;

/// Controller shared between the timer, readers and async adapters.
pub type SharedController = Arc<Mutex<AcquisitionController>>;

/// Which clock the timer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    /// Wall-clock real time
    #[default]
    RealTime,
    /// Live time, excluding dead time
    LiveTime,
}

impl TimerMode {
    /// Preset kind used to start the run.
    pub fn preset_kind(self) -> PresetKind {
        match self {
            Self::RealTime => PresetKind::RealTime,
            Self::LiveTime => PresetKind::LiveTime,
        }
    }

    fn measurement(self, stats: &RunStatistics) -> f64 {
        match self {
            Self::RealTime => stats.real_time,
            Self::LiveTime => stats.live_time,
        }
    }
}

/// Timer facade over a shared controller.
#[derive(Debug, Clone)]
pub struct TimerFacade {
    controller: SharedController,
    mode: TimerMode,
}

impl TimerFacade {
    /// Timer counting `mode` on `controller`.
    pub fn new(controller: SharedController, mode: TimerMode) -> Self {
        Self { controller, mode }
    }

    /// Current mode.
    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    /// Change the mode for the next start.
    pub fn set_mode(&mut self, mode: TimerMode) {
        self.mode = mode;
    }

    /// Underlying controller.
    pub fn controller(&self) -> &SharedController {
        &self.controller
    }

    /// Count for `seconds`, clearing first. Zero starts nothing.
    pub fn start(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            let controller = self.controller.lock();
            return Err(McaError::Range {
                message: format!("Invalid timer interval {} s", seconds),
                max_seconds: controller.clock().max_preset_seconds(),
            });
        }
        if seconds == 0.0 {
            debug!("Zero-length timer interval, no run started");
            return Ok(());
        }
        let preset = PresetSpec {
            kind: self.mode.preset_kind(),
            value: seconds,
        };
        self.controller.lock().start(preset, true)
    }

    /// Stop counting and return the elapsed time in the timer's mode.
    pub fn stop(&self) -> Result<f64> {
        let mut controller = self.controller.lock();
        controller.stop()?;
        let stats = controller.read_statistics()?;
        Ok(self.mode.measurement(&stats))
    }

    /// True while counting.
    pub fn is_busy(&self) -> Result<bool> {
        self.controller.lock().is_busy()
    }

    /// Zero the channel.
    pub fn clear(&self) -> Result<()> {
        self.controller.lock().clear()
    }

    /// Elapsed time of the current or last run, in the timer's mode.
    pub fn last_measurement(&self) -> Result<f64> {
        let stats = self.controller.lock().read_statistics()?;
        Ok(self.mode.measurement(&stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_kinds() {
        assert_eq!(TimerMode::RealTime.preset_kind(), PresetKind::RealTime);
        assert_eq!(TimerMode::LiveTime.preset_kind(), PresetKind::LiveTime);
        assert_eq!(TimerMode::default(), TimerMode::RealTime);
    }

    #[test]
    fn test_measurement_follows_mode() {
        let stats = RunStatistics {
            real_time: 2.0,
            live_time: 1.5,
            ..Default::default()
        };
        assert_eq!(TimerMode::RealTime.measurement(&stats), 2.0);
        assert_eq!(TimerMode::LiveTime.measurement(&stats), 1.5);
    }
}
