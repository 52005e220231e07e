//! Backend over a vendor library addressed by flat detector channel.
//!
//! This library exposes floating-point acquisition values and gain control
//! on top of the integer registers, and can mirror ROIs into hardware SCA
//! registers. Spectrum reads are refused by the firmware mid-run, so the
//! backend skips them while the channel is counting.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{
    BackendCapabilities, ChannelAddress, McaBackend, NativeResult, NativeStatistics, SpectrumRead,
};
use crate::error::{McaError, Result};
use crate::statistics::RunStatistics;

const BACKEND: &str = "detector_library";

/// Vendor library entry points, keyed by detector channel.
pub trait DetectorLibrary: Send + Sync {
    /// Detector channels that share a module with `detector_channel`.
    fn module_channels(&self, detector_channel: u32) -> NativeResult<Vec<u32>>;

    /// Read an integer register.
    fn get_parameter(&self, detector_channel: u32, name: &str) -> NativeResult<u32>;

    /// Write an integer register.
    fn set_parameter(&self, detector_channel: u32, name: &str, value: u32) -> NativeResult<()>;

    /// Start a run with the programmed preset.
    fn start_run(&self, detector_channel: u32, clear: bool) -> NativeResult<()>;

    /// Stop a run and clear the run-enable state.
    fn stop_run(&self, detector_channel: u32) -> NativeResult<()>;

    /// True while counting.
    fn is_running(&self, detector_channel: u32) -> NativeResult<bool>;

    /// Copy the spectrum into `buffer`, returning bins written.
    fn read_spectrum(&self, detector_channel: u32, buffer: &mut [u32]) -> NativeResult<usize>;

    /// Read run counters.
    fn read_statistics(&self, detector_channel: u32) -> NativeResult<NativeStatistics>;

    /// Copy baseline samples into `buffer`.
    fn read_baseline_history(&self, detector_channel: u32, buffer: &mut [u32])
        -> NativeResult<usize>;

    /// Copy an ADC trace into `buffer`.
    fn read_adc_trace(
        &self,
        detector_channel: u32,
        sample_ns: f64,
        buffer: &mut [u32],
    ) -> NativeResult<usize>;

    /// Read a floating-point acquisition value.
    fn get_acquisition_value(&self, detector_channel: u32, name: &str) -> NativeResult<f64>;

    /// Write a floating-point acquisition value.
    fn set_acquisition_value(&self, detector_channel: u32, name: &str, value: f64)
        -> NativeResult<()>;

    /// Relative gain change.
    fn adjust_gain(&self, detector_channel: u32, gain_change: f64) -> NativeResult<()>;

    /// Code reported when a run is started on an already active channel.
    fn run_active_code(&self) -> Option<i32> {
        None
    }

    /// Vendor text for a status code.
    fn error_text(&self, code: i32) -> String;
}

/// [`McaBackend`] bound to one detector channel of a [`DetectorLibrary`].
pub struct DetectorLibraryBackend {
    library: Option<Arc<dyn DetectorLibrary>>,
    detector_channel: u32,
    hardware_scas: bool,
    address: ChannelAddress,
}

impl DetectorLibraryBackend {
    /// Bind to `detector_channel` of `library`.
    pub fn new(library: Arc<dyn DetectorLibrary>, detector_channel: u32) -> Self {
        Self {
            library: Some(library),
            ..Self::unbound(detector_channel)
        }
    }

    /// Backend without a library; every operation fails with `NullOrUnbound`.
    pub fn unbound(detector_channel: u32) -> Self {
        Self {
            library: None,
            detector_channel,
            hardware_scas: false,
            address: ChannelAddress::Detector { detector_channel },
        }
    }

    /// Mirror ROIs into hardware SCA registers.
    pub fn with_hardware_scas(mut self, enabled: bool) -> Self {
        self.hardware_scas = enabled;
        self
    }

    fn library(&self) -> Result<&dyn DetectorLibrary> {
        self.library
            .as_deref()
            .ok_or_else(|| McaError::unbound("detector library"))
    }
}

fn check<T>(library: &dyn DetectorLibrary, result: NativeResult<T>) -> Result<T> {
    result.map_err(|code| McaError::device_io(BACKEND, code, library.error_text(code)))
}

impl McaBackend for DetectorLibraryBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            hardware_scas_are_enabled: self.hardware_scas,
            baseline_history: true,
            gain_adjustment: true,
            adc_trace: true,
            acquisition_values: true,
            ..Default::default()
        }
    }

    fn run_active_code(&self) -> Option<i32> {
        self.library.as_ref().and_then(|lib| lib.run_active_code())
    }

    fn is_busy(&mut self) -> Result<bool> {
        let lib = self.library()?;
        check(lib, lib.is_running(self.detector_channel))
    }

    fn read_parameter(&mut self, name: &str) -> Result<u32> {
        let lib = self.library()?;
        check(lib, lib.get_parameter(self.detector_channel, name))
    }

    fn write_parameter(&mut self, name: &str, value: u32) -> Result<()> {
        let lib = self.library()?;
        check(lib, lib.set_parameter(self.detector_channel, name, value))
    }

    fn write_parameter_to_all_channels(&mut self, name: &str, value: u32) -> Result<()> {
        let lib = self.library()?;
        let channels = check(lib, lib.module_channels(self.detector_channel))?;
        for channel in &channels {
            check(lib, lib.set_parameter(*channel, name, value))?;
        }
        debug!(
            detector_channel = self.detector_channel,
            name,
            value,
            count = channels.len(),
            "Wrote parameter to every channel of the module"
        );
        Ok(())
    }

    fn start_run(&mut self, clear: bool) -> Result<()> {
        let lib = self.library()?;
        check(lib, lib.start_run(self.detector_channel, clear))
    }

    fn stop_run(&mut self) -> Result<()> {
        let lib = self.library()?;
        check(lib, lib.stop_run(self.detector_channel))
    }

    fn read_spectrum(&mut self, buffer: &mut [u32]) -> Result<SpectrumRead> {
        let lib = self.library()?;
        if check(lib, lib.is_running(self.detector_channel))? {
            trace!(
                detector_channel = self.detector_channel,
                "Spectrum read skipped while counting"
            );
            return Ok(SpectrumRead::SkippedBusy);
        }
        let bins = check(lib, lib.read_spectrum(self.detector_channel, buffer))?;
        Ok(SpectrumRead::Complete { bins })
    }

    fn read_statistics(&mut self) -> Result<RunStatistics> {
        let lib = self.library()?;
        let native = check(lib, lib.read_statistics(self.detector_channel))?;
        Ok(native.into_run_statistics(BACKEND))
    }

    fn raw_real_time_ticks(&mut self) -> Result<Option<u64>> {
        let lib = self.library()?;
        let native = check(lib, lib.read_statistics(self.detector_channel))?;
        Ok(Some(native.real_time_ticks))
    }

    fn read_baseline_history(&mut self, buffer: &mut [u32]) -> Result<usize> {
        let lib = self.library()?;
        check(
            lib,
            lib.read_baseline_history(self.detector_channel, buffer),
        )
    }

    fn adjust_gain(&mut self, gain_change: f64) -> Result<()> {
        let lib = self.library()?;
        check(lib, lib.adjust_gain(self.detector_channel, gain_change))
    }

    fn read_adc_trace(&mut self, sample_ns: f64, buffer: &mut [u32]) -> Result<usize> {
        let lib = self.library()?;
        check(
            lib,
            lib.read_adc_trace(self.detector_channel, sample_ns, buffer),
        )
    }

    fn get_acquisition_value(&mut self, name: &str) -> Result<f64> {
        let lib = self.library()?;
        check(lib, lib.get_acquisition_value(self.detector_channel, name))
    }

    fn set_acquisition_value(&mut self, name: &str, value: f64) -> Result<()> {
        let lib = self.library()?;
        check(
            lib,
            lib.set_acquisition_value(self.detector_channel, name, value),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registers;
    use crate::backend::simulator::{
        SimulatedDetectorLibrary, SimulatedHardware, SimulatorSettings, SIM_UNKNOWN_PARAMETER,
    };

    fn backend(channel: u32) -> (DetectorLibraryBackend, SimulatedDetectorLibrary) {
        let library = SimulatedDetectorLibrary::new(SimulatedHardware::shared(
            SimulatorSettings {
                modules: 2,
                ..Default::default()
            },
        ));
        let backend = DetectorLibraryBackend::new(Arc::new(library.clone()), channel);
        (backend, library)
    }

    #[test]
    fn test_capabilities_follow_sca_setting() {
        let (backend, _) = backend(0);
        assert!(!backend.capabilities().hardware_scas_are_enabled);
        let backend = backend.with_hardware_scas(true);
        let caps = backend.capabilities();
        assert!(caps.hardware_scas_are_enabled);
        assert!(caps.gain_adjustment);
        assert!(!caps.remote_presets);
    }

    #[test]
    fn test_spectrum_skipped_while_running() {
        let (mut backend, _) = backend(1);
        let mut buffer = vec![0u32; 2048];

        backend.start_run(true).unwrap();
        assert_eq!(
            backend.read_spectrum(&mut buffer).unwrap(),
            SpectrumRead::SkippedBusy
        );

        backend.stop_run().unwrap();
        assert_eq!(backend.read_spectrum(&mut buffer).unwrap().bins(), 2048);
    }

    #[test]
    fn test_module_wide_write_stays_in_module() {
        let (mut backend, library) = backend(5);
        backend
            .write_parameter_to_all_channels(registers::PRESET_KIND, 1)
            .unwrap();

        let hw = library.hardware().lock();
        let channels: Vec<usize> = hw.write_log().iter().map(|w| w.channel).collect();
        assert_eq!(channels, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_acquisition_values() {
        let (mut backend, _) = backend(0);
        backend.set_acquisition_value("peaking_time", 8.0).unwrap();
        assert_eq!(backend.get_acquisition_value("peaking_time").unwrap(), 8.0);

        let err = backend.get_acquisition_value("nonexistent").unwrap_err();
        assert_eq!(err.device_io_code(), Some(SIM_UNKNOWN_PARAMETER));
    }

    #[test]
    fn test_unbound() {
        let mut backend = DetectorLibraryBackend::unbound(3);
        assert!(backend.adjust_gain(0.1).unwrap_err().is_unbound());
        assert!(backend.start_run(false).unwrap_err().is_unbound());
    }
}
