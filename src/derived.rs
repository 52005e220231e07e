//! Corrected quantities computed from a channel's cached state.
//!
//! The free functions are pure. [`DerivedValueReader`] binds one
//! [`DerivedValue`] to a controller for analog-input style front ends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::controller::{AcquisitionController, Roi};
use crate::error::{McaError, Result};
use crate::statistics::RunStatistics;

/// `numerator / denominator`, or 0 when the denominator is zero or not finite.
pub fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }
    let value = numerator / denominator;
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Sum of the bins in `roi`, clipped to the spectrum length.
pub fn raw_integral(spectrum: &[u32], roi: Roi) -> u64 {
    if roi.low >= spectrum.len() || roi.low > roi.high {
        return 0;
    }
    let high = roi.high.min(spectrum.len() - 1);
    spectrum[roi.low..=high].iter().map(|&c| u64::from(c)).sum()
}

/// `raw * icr / ocr`.
pub fn rate_corrected_integral(raw: u64, stats: &RunStatistics) -> f64 {
    raw as f64 * safe_div(stats.input_count_rate, stats.output_count_rate)
}

/// `rate_corrected * real / live`.
pub fn livetime_corrected_integral(raw: u64, stats: &RunStatistics) -> f64 {
    rate_corrected_integral(raw, stats) * safe_div(stats.real_time, stats.live_time)
}

/// What a [`DerivedValueReader`] produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DerivedValue {
    /// Raw ROI sum
    RoiIntegral(usize),
    /// ROI sum corrected for input/output rate
    RateCorrectedRoi(usize),
    /// Rate-corrected ROI sum further corrected for live time
    LivetimeCorrectedRoi(usize),
    /// Real time in seconds
    RealTime,
    /// Live time in seconds
    LiveTime,
    /// Input count rate
    InputCountRate,
    /// Output count rate
    OutputCountRate,
    /// Fast filter peaks
    FastPeaks,
    /// Binned events
    Events,
    /// Underflows
    Underflows,
    /// Overflows
    Overflows,
    /// Integer register read through the backend
    Parameter(String),
}

impl DerivedValue {
    /// True when the value needs a fresh spectrum.
    pub fn uses_spectrum(&self) -> bool {
        matches!(
            self,
            Self::RoiIntegral(_) | Self::RateCorrectedRoi(_) | Self::LivetimeCorrectedRoi(_)
        )
    }
}

impl fmt::Display for DerivedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoiIntegral(i) => write!(f, "roi:{}", i),
            Self::RateCorrectedRoi(i) => write!(f, "rate_corrected_roi:{}", i),
            Self::LivetimeCorrectedRoi(i) => write!(f, "livetime_corrected_roi:{}", i),
            Self::RealTime => write!(f, "real_time"),
            Self::LiveTime => write!(f, "live_time"),
            Self::InputCountRate => write!(f, "input_count_rate"),
            Self::OutputCountRate => write!(f, "output_count_rate"),
            Self::FastPeaks => write!(f, "fast_peaks"),
            Self::Events => write!(f, "events"),
            Self::Underflows => write!(f, "underflows"),
            Self::Overflows => write!(f, "overflows"),
            Self::Parameter(name) => write!(f, "param:{}", name),
        }
    }
}

impl FromStr for DerivedValue {
    type Err = McaError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((kind, arg)) = s.split_once(':') {
            let roi = || {
                arg.trim().parse::<usize>().map_err(|_| {
                    McaError::invalid_config(format!("Invalid ROI index in '{}'", s))
                })
            };
            return match kind.trim().to_lowercase().as_str() {
                "roi" => Ok(Self::RoiIntegral(roi()?)),
                "rate_corrected_roi" => Ok(Self::RateCorrectedRoi(roi()?)),
                "livetime_corrected_roi" => Ok(Self::LivetimeCorrectedRoi(roi()?)),
                "param" if !arg.trim().is_empty() => Ok(Self::Parameter(arg.trim().to_string())),
                _ => Err(McaError::invalid_config(format!(
                    "Unknown derived value '{}'",
                    s
                ))),
            };
        }

        match s.to_lowercase().as_str() {
            "real_time" => Ok(Self::RealTime),
            "live_time" => Ok(Self::LiveTime),
            "input_count_rate" | "icr" => Ok(Self::InputCountRate),
            "output_count_rate" | "ocr" => Ok(Self::OutputCountRate),
            "fast_peaks" => Ok(Self::FastPeaks),
            "events" => Ok(Self::Events),
            "underflows" => Ok(Self::Underflows),
            "overflows" => Ok(Self::Overflows),
            _ => Err(McaError::invalid_config(format!(
                "Unknown derived value '{}'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for DerivedValue {
    type Error = McaError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DerivedValue> for String {
    fn from(value: DerivedValue) -> Self {
        value.to_string()
    }
}

/// Compute `value` from statistics and a spectrum already in hand.
pub fn evaluate(
    value: &DerivedValue,
    spectrum: &[u32],
    rois: &[Roi],
    stats: &RunStatistics,
) -> Result<f64> {
    let roi = |index: usize| {
        rois.get(index).copied().ok_or_else(|| McaError::InvalidRoi {
            index,
            message: format!("only {} ROIs are defined", rois.len()),
        })
    };

    Ok(match value {
        DerivedValue::RoiIntegral(i) => raw_integral(spectrum, roi(*i)?) as f64,
        DerivedValue::RateCorrectedRoi(i) => {
            rate_corrected_integral(raw_integral(spectrum, roi(*i)?), stats)
        }
        DerivedValue::LivetimeCorrectedRoi(i) => {
            livetime_corrected_integral(raw_integral(spectrum, roi(*i)?), stats)
        }
        DerivedValue::RealTime => stats.real_time,
        DerivedValue::LiveTime => stats.live_time,
        DerivedValue::InputCountRate => stats.input_count_rate,
        DerivedValue::OutputCountRate => stats.output_count_rate,
        DerivedValue::FastPeaks => stats.num_fast_peaks,
        DerivedValue::Events => stats.num_events,
        DerivedValue::Underflows => stats.num_underflows,
        DerivedValue::Overflows => stats.num_overflows,
        DerivedValue::Parameter(name) => {
            return Err(McaError::invalid_config(format!(
                "parameter '{}' needs a controller",
                name
            )))
        }
    })
}

/// One derived value bound to whatever controller is passed to `read`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedValueReader {
    value: DerivedValue,
}

impl DerivedValueReader {
    /// Reader for `value`.
    pub fn new(value: DerivedValue) -> Self {
        Self { value }
    }

    /// The value produced.
    pub fn value(&self) -> &DerivedValue {
        &self.value
    }

    /// Compute the value from `controller`.
    ///
    /// ROI values refresh the spectrum first; a refresh skipped because the
    /// channel is busy falls back to the last completed spectrum.
    pub fn read(&self, controller: &mut AcquisitionController) -> Result<f64> {
        if let DerivedValue::Parameter(name) = &self.value {
            return controller.read_parameter(name).map(f64::from);
        }
        if self.value.uses_spectrum() {
            controller.refresh_spectrum()?;
        }
        let stats = controller.read_statistics()?;
        evaluate(
            &self.value,
            controller.spectrum(),
            controller.rois(),
            &stats,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> RunStatistics {
        RunStatistics {
            real_time: 10.0,
            live_time: 8.0,
            input_count_rate: 1200.0,
            output_count_rate: 1000.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_safe_division() {
        assert_eq!(safe_div(5.0, 0.0), 0.0);
        assert_eq!(safe_div(5.0, f64::NAN), 0.0);
        assert_eq!(safe_div(5.0, 2.0), 2.5);

        let dead = RunStatistics {
            input_count_rate: 1000.0,
            ..Default::default()
        };
        assert_eq!(rate_corrected_integral(500, &dead), 0.0);
        assert_eq!(livetime_corrected_integral(500, &dead), 0.0);

        // counting but no live time accumulated yet
        let no_live_time = RunStatistics {
            real_time: 2.0,
            live_time: 0.0,
            input_count_rate: 1000.0,
            output_count_rate: 800.0,
            ..Default::default()
        };
        assert_eq!(rate_corrected_integral(500, &no_live_time), 625.0);
        let corrected = livetime_corrected_integral(500, &no_live_time);
        assert!(corrected.is_finite());
        assert_eq!(corrected, 0.0);
    }

    #[test]
    fn test_corrections() {
        let spectrum = [1u32, 2, 3, 4, 5];
        let raw = raw_integral(&spectrum, Roi::new(1, 3));
        assert_eq!(raw, 9);
        assert!((rate_corrected_integral(raw, &stats()) - 10.8).abs() < 1e-9);
        assert!((livetime_corrected_integral(raw, &stats()) - 13.5).abs() < 1e-9);
    }

    #[test]
    fn test_raw_integral_clips() {
        let spectrum = [1u32; 4];
        assert_eq!(raw_integral(&spectrum, Roi::new(2, 100)), 2);
        assert_eq!(raw_integral(&spectrum, Roi::new(10, 20)), 0);
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "livetime_corrected_roi:2".parse::<DerivedValue>().unwrap(),
            DerivedValue::LivetimeCorrectedRoi(2)
        );
        assert_eq!(
            "param:PEAKINT".parse::<DerivedValue>().unwrap(),
            DerivedValue::Parameter("PEAKINT".to_string())
        );
        assert_eq!("ICR".parse::<DerivedValue>().unwrap(), DerivedValue::InputCountRate);
        assert!("roi:x".parse::<DerivedValue>().is_err());
        assert!("param:".parse::<DerivedValue>().is_err());
        assert!("temperature".parse::<DerivedValue>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for value in [
            DerivedValue::RoiIntegral(0),
            DerivedValue::RateCorrectedRoi(3),
            DerivedValue::Overflows,
            DerivedValue::Parameter("GAIN".to_string()),
        ] {
            assert_eq!(value.to_string().parse::<DerivedValue>().unwrap(), value);
        }
    }

    #[test]
    fn test_evaluate_missing_roi() {
        let err = evaluate(&DerivedValue::RoiIntegral(1), &[1, 2], &[Roi::new(0, 1)], &stats())
            .unwrap_err();
        assert!(matches!(err, McaError::InvalidRoi { index: 1, .. }));
    }
}
