//! Backend over a vendor library addressed by module and sub-channel.
//!
//! The library keeps its own run state per channel. Spectra and statistics
//! can be read at any time, including mid-run. There are no hardware SCAs;
//! ROIs stay in software.

use std::sync::Arc;

use tracing::debug;

use super::{
    BackendCapabilities, ChannelAddress, McaBackend, NativeResult, NativeStatistics,
    SpectrumRead,
};
use crate::error::{McaError, Result};
use crate::statistics::RunStatistics;

const BACKEND: &str = "module_library";

/// Vendor library entry points, keyed by `(module, sub_channel)`.
///
/// Failures are native status codes; [`ModuleLibrary::error_text`] turns a
/// code into the vendor's message.
pub trait ModuleLibrary: Send + Sync {
    /// Number of sub-channels in `module`.
    fn channels_in_module(&self, module: u32) -> NativeResult<u32>;

    /// Read a register.
    fn read_parameter(&self, module: u32, sub_channel: u32, name: &str) -> NativeResult<u32>;

    /// Write a register.
    fn write_parameter(
        &self,
        module: u32,
        sub_channel: u32,
        name: &str,
        value: u32,
    ) -> NativeResult<()>;

    /// Start a run with the programmed preset.
    fn start_run(&self, module: u32, sub_channel: u32, clear: bool) -> NativeResult<()>;

    /// Stop a run and clear the run-enable state.
    fn stop_run(&self, module: u32, sub_channel: u32) -> NativeResult<()>;

    /// True while counting.
    fn run_status(&self, module: u32, sub_channel: u32) -> NativeResult<bool>;

    /// Copy the spectrum into `buffer`, returning bins written.
    fn read_spectrum(&self, module: u32, sub_channel: u32, buffer: &mut [u32])
        -> NativeResult<usize>;

    /// Read run counters.
    fn read_statistics(&self, module: u32, sub_channel: u32) -> NativeResult<NativeStatistics>;

    /// Copy baseline samples into `buffer`.
    fn read_baseline_history(
        &self,
        module: u32,
        sub_channel: u32,
        buffer: &mut [u32],
    ) -> NativeResult<usize>;

    /// Copy an ADC trace into `buffer`.
    fn read_adc_trace(
        &self,
        module: u32,
        sub_channel: u32,
        sample_ns: f64,
        buffer: &mut [u32],
    ) -> NativeResult<usize>;

    /// Code reported when a run is started on an already active channel.
    fn run_active_code(&self) -> Option<i32> {
        None
    }

    /// Vendor text for a status code.
    fn error_text(&self, code: i32) -> String;
}

/// [`McaBackend`] bound to one `(module, sub_channel)` of a [`ModuleLibrary`].
pub struct ModuleLibraryBackend {
    library: Option<Arc<dyn ModuleLibrary>>,
    module: u32,
    sub_channel: u32,
    address: ChannelAddress,
}

impl ModuleLibraryBackend {
    /// Bind to `(module, sub_channel)` of `library`.
    pub fn new(library: Arc<dyn ModuleLibrary>, module: u32, sub_channel: u32) -> Self {
        Self {
            library: Some(library),
            ..Self::unbound(module, sub_channel)
        }
    }

    /// Backend without a library; every operation fails with `NullOrUnbound`.
    pub fn unbound(module: u32, sub_channel: u32) -> Self {
        Self {
            library: None,
            module,
            sub_channel,
            address: ChannelAddress::Module {
                module,
                sub_channel,
            },
        }
    }

    fn library(&self) -> Result<&dyn ModuleLibrary> {
        self.library
            .as_deref()
            .ok_or_else(|| McaError::unbound("module library"))
    }
}

fn check<T>(library: &dyn ModuleLibrary, result: NativeResult<T>) -> Result<T> {
    result.map_err(|code| McaError::device_io(BACKEND, code, library.error_text(code)))
}

impl McaBackend for ModuleLibraryBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            baseline_history: true,
            adc_trace: true,
            ..Default::default()
        }
    }

    fn run_active_code(&self) -> Option<i32> {
        self.library.as_ref().and_then(|lib| lib.run_active_code())
    }

    fn is_busy(&mut self) -> Result<bool> {
        let lib = self.library()?;
        check(lib, lib.run_status(self.module, self.sub_channel))
    }

    fn read_parameter(&mut self, name: &str) -> Result<u32> {
        let lib = self.library()?;
        check(lib, lib.read_parameter(self.module, self.sub_channel, name))
    }

    fn write_parameter(&mut self, name: &str, value: u32) -> Result<()> {
        let lib = self.library()?;
        check(
            lib,
            lib.write_parameter(self.module, self.sub_channel, name, value),
        )
    }

    fn write_parameter_to_all_channels(&mut self, name: &str, value: u32) -> Result<()> {
        let lib = self.library()?;
        let count = check(lib, lib.channels_in_module(self.module))?;
        for sub_channel in 0..count {
            check(
                lib,
                lib.write_parameter(self.module, sub_channel, name, value),
            )?;
        }
        debug!(
            module = self.module,
            name,
            value,
            count,
            "Wrote parameter to every channel of the module"
        );
        Ok(())
    }

    fn start_run(&mut self, clear: bool) -> Result<()> {
        let lib = self.library()?;
        check(lib, lib.start_run(self.module, self.sub_channel, clear))
    }

    fn stop_run(&mut self) -> Result<()> {
        let lib = self.library()?;
        check(lib, lib.stop_run(self.module, self.sub_channel))
    }

    fn read_spectrum(&mut self, buffer: &mut [u32]) -> Result<SpectrumRead> {
        let lib = self.library()?;
        let bins = check(
            lib,
            lib.read_spectrum(self.module, self.sub_channel, buffer),
        )?;
        Ok(SpectrumRead::Complete { bins })
    }

    fn read_statistics(&mut self) -> Result<RunStatistics> {
        let lib = self.library()?;
        let native = check(lib, lib.read_statistics(self.module, self.sub_channel))?;
        Ok(native.into_run_statistics(BACKEND))
    }

    fn raw_real_time_ticks(&mut self) -> Result<Option<u64>> {
        let lib = self.library()?;
        let native = check(lib, lib.read_statistics(self.module, self.sub_channel))?;
        Ok(Some(native.real_time_ticks))
    }

    fn read_baseline_history(&mut self, buffer: &mut [u32]) -> Result<usize> {
        let lib = self.library()?;
        check(
            lib,
            lib.read_baseline_history(self.module, self.sub_channel, buffer),
        )
    }

    fn read_adc_trace(&mut self, sample_ns: f64, buffer: &mut [u32]) -> Result<usize> {
        let lib = self.library()?;
        check(
            lib,
            lib.read_adc_trace(self.module, self.sub_channel, sample_ns, buffer),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registers;
    use crate::backend::simulator::{
        SimulatedHardware, SimulatedModuleLibrary, SimulatorSettings, SIM_BAD_CHANNEL,
    };

    fn backend(sub_channel: u32) -> (ModuleLibraryBackend, SimulatedModuleLibrary) {
        let library = SimulatedModuleLibrary::new(SimulatedHardware::shared(
            SimulatorSettings::default(),
        ));
        let backend = ModuleLibraryBackend::new(Arc::new(library.clone()), 0, sub_channel);
        (backend, library)
    }

    #[test]
    fn test_unbound_backend_fails_every_call() {
        let mut backend = ModuleLibraryBackend::unbound(0, 0);
        assert!(backend.is_busy().unwrap_err().is_unbound());
        assert!(backend
            .write_parameter(registers::PRESET_LOW, 1)
            .unwrap_err()
            .is_unbound());
        assert!(backend.run_active_code().is_none());
    }

    #[test]
    fn test_write_to_all_channels_covers_module() {
        let (mut backend, library) = backend(2);
        backend
            .write_parameter_to_all_channels(registers::PRESET_KIND, 2)
            .unwrap();

        let hw = library.hardware().lock();
        let channels: Vec<usize> = hw.write_log().iter().map(|w| w.channel).collect();
        assert_eq!(channels, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_native_codes_carry_vendor_text() {
        let library = SimulatedModuleLibrary::new(SimulatedHardware::shared(
            SimulatorSettings::default(),
        ));
        let mut backend = ModuleLibraryBackend::new(Arc::new(library), 0, 9);
        let err = backend.read_parameter("PEAKINT").unwrap_err();
        assert_eq!(err.device_io_code(), Some(SIM_BAD_CHANNEL));
        assert!(err.to_string().contains("channel out of range"));
    }

    #[test]
    fn test_reads_while_running() {
        let (mut backend, _library) = backend(0);
        backend.start_run(true).unwrap();
        assert!(backend.is_busy().unwrap());

        let mut buffer = vec![0u32; 512];
        assert_eq!(
            backend.read_spectrum(&mut buffer).unwrap(),
            SpectrumRead::Complete { bins: 512 }
        );
        assert!(backend.adjust_gain(0.1).unwrap_err().is_unsupported());
        backend.stop_run().unwrap();
    }
}
