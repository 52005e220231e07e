//! # Rust MCA
//!
//! Acquisition control for multichannel analyzers (MCAs): pulse-height
//! spectrometers that bin detector events by amplitude.
//!
//! A channel is opened once against one backend and then driven through an
//! [`AcquisitionController`]. The controller handles presets, start/stop,
//! run statistics, regions of interest and clock calibration without knowing
//! which backend it holds.
//!
//! ## Crate Structure
//!
//! - **`backend`**: The [`McaBackend`] capability set and its three variants
//!   (module library, detector library, remote peer), plus simulated hardware.
//! - **`timing`**: Clock tick model, preset register encoding and tick
//!   calibration.
//! - **`preset`**: Preset kinds and their register encoding.
//! - **`statistics`**: Run statistics and the statistics cache.
//! - **`controller`**: The per-channel acquisition state machine.
//! - **`derived`**: ROI integrals and rate/live-time corrections.
//! - **`timer`**: A channel exposed as a "count for N seconds" timer.
//! - **`registry`**: Channels by id, opened from configuration.
//! - **`capabilities`** / **`hal`**: Async capability traits and adapters for
//!   front ends.
//! - **`config`** / **`logging`**: Figment configuration and tracing setup.
//! - **`error`**: The [`McaError`] enum.

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod controller;
pub mod derived;
pub mod error;
pub mod hal;
pub mod logging;
pub mod preset;
pub mod registry;
pub mod statistics;
pub mod timer;
pub mod timing;

pub use backend::{BackendCapabilities, ChannelAddress, McaBackend, SpectrumRead};
pub use controller::{AcquisitionController, AcquisitionState, ControllerOptions, RetryPolicy, Roi};
pub use derived::{DerivedValue, DerivedValueReader};
pub use error::{McaError, Result};
pub use preset::{PresetKind, PresetSpec};
pub use registry::{LibraryBindings, McaRegistry};
pub use statistics::RunStatistics;
pub use timer::{SharedController, TimerFacade, TimerMode};
pub use timing::ClockTickModel;
