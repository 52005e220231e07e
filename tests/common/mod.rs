//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_mca::backend::{
    BackendCapabilities, ChannelAddress, McaBackend, ModuleLibraryBackend, SimulatedHardware,
    SimulatedModuleLibrary, SimulatorSettings, SpectrumRead,
};
use rust_mca::{
    AcquisitionController, ClockTickModel, ControllerOptions, McaError, Result, RetryPolicy,
    RunStatistics,
};

/// Run-active code used by [`ScriptedBackend`].
pub const SCRIPTED_RUN_ACTIVE: i32 = -7;

/// A call seen by [`ScriptedBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Write { name: String, value: u32 },
    WriteAll { name: String, value: u32 },
    Start { clear: bool },
    Stop,
    ReadStatistics,
    IsBusy,
}

/// Behavior and call log of a [`ScriptedBackend`], shared with the test.
#[derive(Debug, Default)]
pub struct Script {
    pub calls: Vec<Call>,
    /// Answers for successive busy polls; `false` once exhausted
    pub busy: VecDeque<bool>,
    /// Codes returned by successive starts; success once exhausted
    pub start_errors: VecDeque<i32>,
    /// Register whose write fails
    pub failing_write: Option<String>,
    pub statistics: RunStatistics,
    pub capabilities: BackendCapabilities,
}

impl Script {
    pub fn count(&self, wanted: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| wanted(c)).count()
    }

    pub fn stops(&self) -> usize {
        self.count(|c| *c == Call::Stop)
    }

    pub fn starts(&self) -> usize {
        self.count(|c| matches!(c, Call::Start { .. }))
    }

    pub fn preset_writes(&self) -> usize {
        self.count(|c| match c {
            Call::Write { name, .. } | Call::WriteAll { name, .. } => name.starts_with("PRESET_"),
            _ => false,
        })
    }
}

/// Backend driven entirely by a [`Script`].
pub struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
    address: ChannelAddress,
}

impl ScriptedBackend {
    pub fn new() -> (Self, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        let backend = Self {
            script: Arc::clone(&script),
            address: ChannelAddress::Module {
                module: 0,
                sub_channel: 0,
            },
        };
        (backend, script)
    }
}

impl McaBackend for ScriptedBackend {
    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.script.lock().capabilities
    }

    fn run_active_code(&self) -> Option<i32> {
        Some(SCRIPTED_RUN_ACTIVE)
    }

    fn is_busy(&mut self) -> Result<bool> {
        let mut script = self.script.lock();
        script.calls.push(Call::IsBusy);
        Ok(script.busy.pop_front().unwrap_or(false))
    }

    fn read_parameter(&mut self, _name: &str) -> Result<u32> {
        Ok(0)
    }

    fn write_parameter(&mut self, name: &str, value: u32) -> Result<()> {
        let mut script = self.script.lock();
        if script.failing_write.as_deref() == Some(name) {
            return Err(McaError::device_io("scripted", -1, "write refused"));
        }
        script.calls.push(Call::Write {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    fn write_parameter_to_all_channels(&mut self, name: &str, value: u32) -> Result<()> {
        let mut script = self.script.lock();
        if script.failing_write.as_deref() == Some(name) {
            return Err(McaError::device_io("scripted", -1, "write refused"));
        }
        script.calls.push(Call::WriteAll {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    fn start_run(&mut self, clear: bool) -> Result<()> {
        let mut script = self.script.lock();
        script.calls.push(Call::Start { clear });
        match script.start_errors.pop_front() {
            Some(code) => Err(McaError::device_io("scripted", code, "start refused")),
            None => Ok(()),
        }
    }

    fn stop_run(&mut self) -> Result<()> {
        self.script.lock().calls.push(Call::Stop);
        Ok(())
    }

    fn read_spectrum(&mut self, buffer: &mut [u32]) -> Result<SpectrumRead> {
        for (i, bin) in buffer.iter_mut().enumerate() {
            *bin = i as u32;
        }
        Ok(SpectrumRead::Complete { bins: buffer.len() })
    }

    fn read_statistics(&mut self) -> Result<RunStatistics> {
        let mut script = self.script.lock();
        script.calls.push(Call::ReadStatistics);
        Ok(script.statistics)
    }
}

/// Fast retry policy for tests.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_start_retries: 3,
        busy_poll_interval: std::time::Duration::from_millis(1),
        stop_wait_timeout: std::time::Duration::from_millis(200),
    }
}

/// Options with known 400 ns ticks.
pub fn options(max_bins: usize) -> ControllerOptions {
    ControllerOptions {
        max_bins,
        runtime_tick_seconds: Some(400e-9),
        preset_tick_seconds: Some(400e-9),
        retry: fast_retry(),
        ..Default::default()
    }
}

/// Controller over a [`ScriptedBackend`] with 400 ns ticks.
pub fn scripted_controller() -> (AcquisitionController, Arc<Mutex<Script>>) {
    let (backend, script) = ScriptedBackend::new();
    let clock = ClockTickModel::new(400e-9, 400e-9).unwrap_or_default();
    let controller = AcquisitionController::new("scripted", Box::new(backend), clock, &options(16));
    (controller, script)
}

/// Simulated module rack and a controller on module 0, sub-channel `sub`.
pub fn simulated_controller(
    settings: SimulatorSettings,
    sub: u32,
) -> (AcquisitionController, Arc<Mutex<SimulatedHardware>>) {
    let hardware = SimulatedHardware::shared(settings);
    let library = Arc::new(SimulatedModuleLibrary::new(Arc::clone(&hardware)));
    let backend = ModuleLibraryBackend::new(library, 0, sub);
    let clock = ClockTickModel::new(400e-9, 400e-9).unwrap_or_default();
    let controller = AcquisitionController::new(
        format!("sim{}", sub),
        Box::new(backend),
        clock,
        &options(2048),
    );
    (controller, hardware)
}
