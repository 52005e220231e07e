//! Acquisition controller behavior against scripted and simulated backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{scripted_controller, simulated_controller, Call, SCRIPTED_RUN_ACTIVE};
use rust_mca::backend::{
    registers, DetectorLibraryBackend, ModuleLibraryBackend, SimulatedDetectorLibrary,
    SimulatedHardware, SimulatedModuleLibrary, SimulatorSettings,
};
use rust_mca::timing::CalibrationSettings;
use rust_mca::{
    AcquisitionController, AcquisitionState, ClockTickModel, ControllerOptions, McaError,
    PresetKind, PresetSpec, Roi, RunStatistics,
};

// =============================================================================
// Preset programming
// =============================================================================

#[test]
fn test_preset_write_order_and_encoding() {
    let (mut controller, script) = scripted_controller();

    controller.start(PresetSpec::live_time(10.0), false).unwrap();

    let calls = script.lock().calls.clone();
    assert_eq!(
        calls,
        vec![
            Call::WriteAll {
                name: registers::PRESET_KIND.to_string(),
                value: PresetKind::LiveTime.register_value(),
            },
            Call::Write {
                name: registers::PRESET_HIGH.to_string(),
                value: 381,
            },
            Call::Write {
                name: registers::PRESET_LOW.to_string(),
                value: 23_104,
            },
            Call::Start { clear: false },
        ]
    );
    assert_eq!(controller.state(), AcquisitionState::Running);
}

#[test]
fn test_unchanged_preset_skips_register_writes() {
    let (mut controller, script) = scripted_controller();

    controller.start(PresetSpec::real_time(1.0), true).unwrap();
    controller.stop().unwrap();
    controller.start(PresetSpec::real_time(1.0), true).unwrap();
    controller.stop().unwrap();
    assert_eq!(script.lock().preset_writes(), 3);
    assert_eq!(controller.preset_programs(), 1);

    controller.start(PresetSpec::real_time(2.0), true).unwrap();
    assert_eq!(script.lock().preset_writes(), 6);
    assert_eq!(controller.preset_programs(), 2);
}

#[test]
fn test_preset_remembered_only_after_all_writes() {
    let (mut controller, script) = scripted_controller();
    script.lock().failing_write = Some(registers::PRESET_LOW.to_string());

    let err = controller.start(PresetSpec::real_time(1.0), false).unwrap_err();
    assert_eq!(err.device_io_code(), Some(-1));
    assert_eq!(controller.last_applied_preset(), None);
    assert_eq!(controller.state(), AcquisitionState::Idle);
    assert_eq!(script.lock().starts(), 0);

    {
        let mut s = script.lock();
        s.failing_write = None;
        s.calls.clear();
    }
    controller.start(PresetSpec::real_time(1.0), false).unwrap();
    assert_eq!(script.lock().preset_writes(), 3);
    assert!(controller.last_applied_preset().is_some());
}

#[test]
fn test_manual_preset_write_forces_reprogram() {
    let (mut controller, script) = scripted_controller();
    controller.start(PresetSpec::real_time(1.0), false).unwrap();
    controller.stop().unwrap();

    controller.write_parameter(registers::PRESET_LOW, 7).unwrap();
    script.lock().calls.clear();

    controller.start(PresetSpec::real_time(1.0), false).unwrap();
    assert_eq!(script.lock().preset_writes(), 3);
}

#[test]
fn test_out_of_range_preset_writes_nothing() {
    let (mut controller, script) = scripted_controller();
    let err = controller.start(PresetSpec::real_time(1.0e6), false).unwrap_err();
    assert!(matches!(err, McaError::Range { .. }));
    assert!(script.lock().calls.is_empty());
}

#[test]
fn test_kind_written_module_wide_on_simulator() {
    let (mut controller, hardware) = simulated_controller(SimulatorSettings::default(), 1);
    controller.start(PresetSpec::real_time(0.5), true).unwrap();

    let hw = hardware.lock();
    let kind_channels: Vec<usize> = hw
        .write_log()
        .iter()
        .filter(|w| w.name == registers::PRESET_KIND)
        .map(|w| w.channel)
        .collect();
    assert_eq!(kind_channels, vec![0, 1, 2, 3]);

    let word_channels: Vec<usize> = hw
        .write_log()
        .iter()
        .filter(|w| w.name == registers::PRESET_HIGH || w.name == registers::PRESET_LOW)
        .map(|w| w.channel)
        .collect();
    assert_eq!(word_channels, vec![1, 1]);
    assert!(hw.run_enabled(1));
    assert!(!hw.run_enabled(0));
}

// =============================================================================
// Statistics and run end
// =============================================================================

#[test]
fn test_statistics_read_once_per_run() {
    let (mut controller, script) = scripted_controller();
    script.lock().statistics = RunStatistics {
        real_time: 2_500_000.0,
        live_time: 2_000_000.0,
        input_count_rate: 1000.0,
        output_count_rate: 900.0,
        ..Default::default()
    };

    controller.start(PresetSpec::real_time(1.0), true).unwrap();
    script.lock().busy.extend([true, false]);
    assert!(controller.is_busy().unwrap());
    assert!(!controller.is_busy().unwrap());

    let first = controller.read_statistics().unwrap();
    let second = controller.read_statistics().unwrap();
    assert_eq!(first, second);
    assert!((first.real_time - 1.0).abs() < 1e-9);
    assert!((first.live_time - 0.8).abs() < 1e-9);
    assert_eq!(script.lock().count(|c| *c == Call::ReadStatistics), 1);

    // A new run invalidates the cached value
    controller.start(PresetSpec::real_time(1.0), true).unwrap();
    controller.stop().unwrap();
    controller.read_statistics().unwrap();
    assert_eq!(script.lock().count(|c| *c == Call::ReadStatistics), 2);
}

#[test]
fn test_forced_read_bypasses_cache() {
    let (mut controller, script) = scripted_controller();
    controller.read_statistics().unwrap();
    controller.read_statistics().unwrap();
    controller.read_statistics_forced().unwrap();
    assert_eq!(script.lock().count(|c| *c == Call::ReadStatistics), 2);
}

#[test]
fn test_single_stop_when_run_ends() {
    let (mut controller, script) = scripted_controller();
    controller.start(PresetSpec::real_time(1.0), false).unwrap();
    script.lock().busy.extend([true, true, false, false, false]);

    for _ in 0..5 {
        controller.is_busy().unwrap();
    }
    assert_eq!(script.lock().stops(), 1);
    assert_eq!(controller.state(), AcquisitionState::Idle);
    assert!(!controller.channel().busy);
}

#[test]
fn test_simulated_run_ends_on_preset() {
    let (mut controller, hardware) = simulated_controller(SimulatorSettings::default(), 0);
    controller.start(PresetSpec::real_time(0.05), true).unwrap();
    assert!(controller.is_busy().unwrap());

    controller.wait_for_idle(Duration::from_secs(2)).unwrap();
    assert!(!hardware.lock().run_enabled(0));

    let stats = controller.read_statistics().unwrap();
    assert!((stats.real_time - 0.05).abs() < 0.01, "real_time {}", stats.real_time);
    assert!(stats.live_time < stats.real_time);
    assert!(stats.num_events > 0.0);
}

// =============================================================================
// Start retry
// =============================================================================

#[test]
fn test_run_active_start_is_retried() {
    let (mut controller, script) = scripted_controller();
    script
        .lock()
        .start_errors
        .extend([SCRIPTED_RUN_ACTIVE, SCRIPTED_RUN_ACTIVE]);

    controller.start(PresetSpec::real_time(1.0), false).unwrap();
    let s = script.lock();
    assert_eq!(s.starts(), 3);
    assert_eq!(s.stops(), 2);
}

#[test]
fn test_retry_is_bounded() {
    let (mut controller, script) = scripted_controller();
    script.lock().start_errors.extend([SCRIPTED_RUN_ACTIVE; 10]);

    let err = controller.start(PresetSpec::real_time(1.0), false).unwrap_err();
    assert_eq!(err.device_io_code(), Some(SCRIPTED_RUN_ACTIVE));
    // first attempt plus max_start_retries
    assert_eq!(script.lock().starts(), 4);
    assert_eq!(controller.state(), AcquisitionState::Idle);
}

#[test]
fn test_other_start_errors_not_retried() {
    let (mut controller, script) = scripted_controller();
    script.lock().start_errors.push_back(-3);

    let err = controller.start(PresetSpec::real_time(1.0), false).unwrap_err();
    assert_eq!(err.device_io_code(), Some(-3));
    assert_eq!(script.lock().starts(), 1);
    assert_eq!(script.lock().stops(), 0);
}

#[test]
fn test_stale_run_enable_recovered() {
    let (mut controller, hardware) = simulated_controller(SimulatorSettings::default(), 0);
    hardware.lock().leave_run_enabled(0).unwrap();

    controller.start(PresetSpec::real_time(0.5), true).unwrap();
    assert!(controller.is_busy().unwrap());
    controller.stop().unwrap();
}

// =============================================================================
// Clock calibration
// =============================================================================

fn calibration_options() -> ControllerOptions {
    ControllerOptions {
        calibration: CalibrationSettings {
            target_seconds: 0.1,
            timeout_seconds: 3.0,
            poll_interval: Duration::from_millis(1),
        },
        retry: common::fast_retry(),
        ..Default::default()
    }
}

#[test]
fn test_open_calibrates_slow_clock() {
    let settings = SimulatorSettings {
        runtime_tick_seconds: 800e-9,
        preset_tick_seconds: 800e-9,
        ..Default::default()
    };
    let hardware = SimulatedHardware::shared(settings);
    let library = Arc::new(SimulatedModuleLibrary::new(Arc::clone(&hardware)));
    let backend = ModuleLibraryBackend::new(library, 0, 0);

    let controller =
        AcquisitionController::open("slow", Box::new(backend), &calibration_options()).unwrap();
    assert!((controller.clock().preset_tick_seconds() - 800e-9).abs() < 1e-12);
    assert!((controller.clock().runtime_tick_seconds() - 800e-9).abs() < 1e-12);
    assert!(!hardware.lock().run_enabled(0));
}

#[test]
fn test_open_keeps_configured_ticks() {
    let hardware = SimulatedHardware::shared(SimulatorSettings::default());
    let library = Arc::new(SimulatedModuleLibrary::new(Arc::clone(&hardware)));
    let backend = ModuleLibraryBackend::new(library, 0, 0);
    let options = ControllerOptions {
        runtime_tick_seconds: Some(1e-6),
        preset_tick_seconds: Some(2e-6),
        ..calibration_options()
    };

    let controller = AcquisitionController::open("fixed", Box::new(backend), &options).unwrap();
    assert_eq!(controller.clock().runtime_tick_seconds(), 1e-6);
    assert_eq!(controller.clock().preset_tick_seconds(), 2e-6);
    assert!(hardware.lock().write_log().is_empty());
}

#[test]
fn test_calibrate_clock_requires_idle() {
    let (mut controller, _script) = scripted_controller();
    controller.start(PresetSpec::real_time(1.0), false).unwrap();
    let err = controller
        .calibrate_clock(&calibration_options().calibration)
        .unwrap_err();
    assert!(matches!(err, McaError::InvalidConfig { .. }));
}

// =============================================================================
// ROIs and SCAs
// =============================================================================

#[test]
fn test_rois_mirrored_into_hardware_scas() {
    let hardware = SimulatedHardware::shared(SimulatorSettings::default());
    let library = Arc::new(SimulatedDetectorLibrary::new(Arc::clone(&hardware)));
    let backend = DetectorLibraryBackend::new(library, 2).with_hardware_scas(true);
    let clock = ClockTickModel::default();
    let mut controller =
        AcquisitionController::new("xmap", Box::new(backend), clock, &common::options(2048));

    controller
        .set_rois(&[Roi::new(100, 200), Roi::new(450, 520)])
        .unwrap();

    let hw = hardware.lock();
    assert_eq!(hw.read_param(2, "SCA0LO").unwrap(), 100);
    assert_eq!(hw.read_param(2, "SCA0HI").unwrap(), 200);
    assert_eq!(hw.read_param(2, "SCA1LO").unwrap(), 450);
    assert_eq!(hw.read_param(2, "SCA1HI").unwrap(), 520);
    assert_eq!(hw.read_param(2, registers::NUM_SCAS).unwrap(), 2);
}

#[test]
fn test_rois_kept_when_sca_write_fails() {
    let (mut controller, script) = scripted_controller();
    script.lock().capabilities.hardware_scas_are_enabled = true;

    controller.set_rois(&[Roi::new(1, 3)]).unwrap();
    assert_eq!(controller.rois(), &[Roi::new(1, 3)]);

    script.lock().failing_write = Some(registers::sca_high(1));
    let err = controller
        .set_rois(&[Roi::new(2, 4), Roi::new(6, 9)])
        .unwrap_err();
    assert_eq!(err.device_io_code(), Some(-1));

    // the previous table survives the failed replacement
    assert_eq!(controller.rois(), &[Roi::new(1, 3)]);
    let num_scas_writes = script.lock().count(|c| {
        matches!(c, Call::Write { name, .. } if name == registers::NUM_SCAS)
    });
    assert_eq!(num_scas_writes, 1);
}

#[test]
fn test_roi_validation() {
    let (mut controller, script) = scripted_controller();

    assert!(matches!(
        controller.set_roi(1, Roi::new(0, 4)),
        Err(McaError::InvalidRoi { index: 1, .. })
    ));
    assert!(controller.set_roi(0, Roi::new(5, 2)).is_err());
    assert!(controller.set_roi(0, Roi::new(0, 16)).is_err());

    controller.set_roi(0, Roi::new(2, 5)).unwrap();
    assert_eq!(controller.rois(), &[Roi::new(2, 5)]);
    // no SCA capability, nothing written
    assert!(script.lock().calls.is_empty());

    controller.refresh_spectrum().unwrap();
    assert_eq!(controller.raw_roi_integral(0).unwrap(), 2 + 3 + 4 + 5);
}

// =============================================================================
// Capabilities
// =============================================================================

#[test]
fn test_missing_capabilities_are_unsupported() {
    let (mut controller, _script) = scripted_controller();
    let mut buffer = [0u32; 16];

    assert!(controller.read_baseline_history(&mut buffer).unwrap_err().is_unsupported());
    assert!(controller.adjust_gain(0.01).unwrap_err().is_unsupported());
    assert!(controller.read_adc_trace(50.0, &mut buffer).unwrap_err().is_unsupported());
    assert!(controller.get_acquisition_value("peaking_time").unwrap_err().is_unsupported());
}

#[test]
fn test_detector_library_optional_operations() {
    let hardware = SimulatedHardware::shared(SimulatorSettings::default());
    let library = Arc::new(SimulatedDetectorLibrary::new(Arc::clone(&hardware)));
    let backend = DetectorLibraryBackend::new(library, 0);
    let mut controller = AcquisitionController::new(
        "det",
        Box::new(backend),
        ClockTickModel::default(),
        &common::options(2048),
    );

    controller.set_acquisition_value("peaking_time", 2.0).unwrap();
    assert_eq!(controller.get_acquisition_value("peaking_time").unwrap(), 2.0);
    controller.adjust_gain(0.05).unwrap();
    assert!((hardware.lock().gain(0).unwrap() - 1.05).abs() < 1e-9);

    let mut trace = [0u32; 64];
    assert_eq!(controller.read_adc_trace(50.0, &mut trace).unwrap(), 64);
}

#[test]
fn test_clear_zeroes_local_state() {
    let (mut controller, _hardware) = simulated_controller(SimulatorSettings::default(), 0);
    controller.start(PresetSpec::real_time(0.02), true).unwrap();
    controller.wait_for_idle(Duration::from_secs(2)).unwrap();
    controller.refresh_spectrum().unwrap();
    assert!(controller.spectrum().iter().any(|&c| c > 0));

    controller.clear().unwrap();
    assert!(controller.spectrum().is_empty());
    let stats = controller.read_statistics().unwrap();
    assert!(stats.real_time < 0.01);
}
