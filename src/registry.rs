//! Channel registry.
//!
//! Maps channel ids to shared controllers. Each controller is opened once,
//! with its backend chosen from configuration, and the registry refuses a
//! second controller under the same id.
//!
//! # Example
//!
//! ```rust,ignore
//! use rust_mca::{config::McaConfig, registry::{LibraryBindings, McaRegistry}};
//!
//! let config = McaConfig::load()?;
//! let registry = McaRegistry::from_config(&config, &LibraryBindings::new())?;
//! let timer = registry.timer("mca1")?;
//! timer.start(2.0)?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backend::{
    DetectorLibrary, DetectorLibraryBackend, McaBackend, ModuleLibrary, ModuleLibraryBackend,
    RemoteProxyBackend, SimulatedDetectorLibrary, SimulatedHardware, SimulatedModuleLibrary,
    SimulatedRemotePeer, TcpFieldClient,
};
use crate::config::{BackendConfig, ChannelConfig, McaConfig};
use crate::controller::{AcquisitionController, ChannelId};
use crate::derived::DerivedValue;
use crate::error::{McaError, Result};
use crate::hal::{ReadableDerivedValue, SettableMca, TriggerableTimer};
use crate::timer::{SharedController, TimerFacade, TimerMode};

// =============================================================================
// Library Bindings
// =============================================================================

/// Vendor libraries available to local channels, by binding name.
#[derive(Clone, Default)]
pub struct LibraryBindings {
    module_libraries: HashMap<String, Arc<dyn ModuleLibrary>>,
    detector_libraries: HashMap<String, Arc<dyn DetectorLibrary>>,
}

impl LibraryBindings {
    /// No libraries bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a module library under `name`.
    pub fn with_module_library(
        mut self,
        name: impl Into<String>,
        library: Arc<dyn ModuleLibrary>,
    ) -> Self {
        self.module_libraries.insert(name.into(), library);
        self
    }

    /// Bind a detector library under `name`.
    pub fn with_detector_library(
        mut self,
        name: impl Into<String>,
        library: Arc<dyn DetectorLibrary>,
    ) -> Self {
        self.detector_libraries.insert(name.into(), library);
        self
    }

    /// Module library bound as `name`.
    pub fn module_library(&self, name: &str) -> Option<Arc<dyn ModuleLibrary>> {
        self.module_libraries.get(name).cloned()
    }

    /// Detector library bound as `name`.
    pub fn detector_library(&self, name: &str) -> Option<Arc<dyn DetectorLibrary>> {
        self.detector_libraries.get(name).cloned()
    }
}

impl std::fmt::Debug for LibraryBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut modules: Vec<_> = self.module_libraries.keys().collect();
        let mut detectors: Vec<_> = self.detector_libraries.keys().collect();
        modules.sort();
        detectors.sort();
        f.debug_struct("LibraryBindings")
            .field("module_libraries", &modules)
            .field("detector_libraries", &detectors)
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registered channels by id.
#[derive(Debug, Default)]
pub struct McaRegistry {
    controllers: HashMap<ChannelId, SharedController>,
    timer_modes: HashMap<ChannelId, TimerMode>,
}

impl McaRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every configured channel.
    ///
    /// Mock channels on the same library name share one simulated hardware
    /// instance, so module-wide registers behave as on real hardware.
    pub fn from_config(config: &McaConfig, bindings: &LibraryBindings) -> Result<Self> {
        config.validate()?;

        let mut registry = Self::new();
        let mut simulators: HashMap<String, Arc<Mutex<SimulatedHardware>>> = HashMap::new();

        for channel in &config.channels {
            let backend = open_backend(channel, bindings, &mut simulators)?;
            let controller =
                AcquisitionController::open(channel.id.clone(), backend, &channel.controller_options())?;
            registry.register(channel.id.clone(), Arc::new(Mutex::new(controller)))?;
            registry
                .timer_modes
                .insert(channel.id.clone(), channel.timer_mode);
        }

        info!(channels = registry.len(), "MCA registry ready");
        Ok(registry)
    }

    /// Register `controller` under `id`.
    pub fn register(&mut self, id: impl Into<ChannelId>, controller: SharedController) -> Result<()> {
        let id = id.into();
        if self.controllers.contains_key(&id) {
            return Err(McaError::ChannelAlreadyRegistered { id });
        }
        debug!(channel = %id, "Registered MCA channel");
        self.controllers.insert(id, controller);
        Ok(())
    }

    /// Controller registered as `id`.
    pub fn get(&self, id: &str) -> Result<&SharedController> {
        self.controllers.get(id).ok_or_else(|| not_found(id))
    }

    /// Mutable slot for `id`, to swap in a replacement controller.
    pub fn get_mut(&mut self, id: &str) -> Result<&mut SharedController> {
        self.controllers.get_mut(id).ok_or_else(|| not_found(id))
    }

    /// Unregister `id`, returning its controller.
    pub fn remove(&mut self, id: &str) -> Result<SharedController> {
        self.timer_modes.remove(id);
        self.controllers.remove(id).ok_or_else(|| not_found(id))
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.controllers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Check if a channel is registered
    pub fn contains(&self, id: &str) -> bool {
        self.controllers.contains_key(id)
    }

    /// Get count of registered channels
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    // =========================================================================
    // Front-end Access
    // =========================================================================

    /// Timer over `id`, in its configured mode.
    pub fn timer(&self, id: &str) -> Result<TimerFacade> {
        let controller = Arc::clone(self.get(id)?);
        let mode = self.timer_modes.get(id).copied().unwrap_or_default();
        Ok(TimerFacade::new(controller, mode))
    }

    /// `value` of channel `id` as a [`crate::capabilities::Readable`].
    pub fn readable(&self, id: &str, value: DerivedValue) -> Result<ReadableDerivedValue> {
        Ok(ReadableDerivedValue::new(Arc::clone(self.get(id)?), value))
    }

    /// Registers of channel `id` as a [`crate::capabilities::Settable`].
    pub fn settable(&self, id: &str) -> Result<SettableMca> {
        Ok(SettableMca::new(Arc::clone(self.get(id)?)))
    }

    /// Timer of channel `id` as a [`crate::capabilities::Triggerable`].
    pub fn triggerable(&self, id: &str, preset_seconds: f64) -> Result<TriggerableTimer> {
        Ok(TriggerableTimer::new(self.timer(id)?, preset_seconds))
    }
}

fn not_found(id: &str) -> McaError {
    McaError::ChannelNotFound { id: id.to_string() }
}

// =============================================================================
// Backend Selection (Private)
// =============================================================================

fn open_backend(
    channel: &ChannelConfig,
    bindings: &LibraryBindings,
    simulators: &mut HashMap<String, Arc<Mutex<SimulatedHardware>>>,
) -> Result<Box<dyn McaBackend>> {
    let mut simulated = |key: String| {
        Arc::clone(
            simulators
                .entry(key)
                .or_insert_with(|| SimulatedHardware::shared(channel.simulator.clone())),
        )
    };

    let backend: Box<dyn McaBackend> = match &channel.backend {
        BackendConfig::ModuleLibrary {
            module,
            sub_channel,
            library,
        } => {
            let library: Arc<dyn ModuleLibrary> = if channel.mock {
                Arc::new(SimulatedModuleLibrary::new(simulated(format!(
                    "module_library:{}",
                    library
                ))))
            } else {
                bindings
                    .module_library(library)
                    .ok_or_else(|| McaError::unbound(format!("module library '{}'", library)))?
            };
            Box::new(ModuleLibraryBackend::new(library, *module, *sub_channel))
        }
        BackendConfig::DetectorLibrary {
            detector_channel,
            hardware_scas,
            library,
        } => {
            let library: Arc<dyn DetectorLibrary> = if channel.mock {
                Arc::new(SimulatedDetectorLibrary::new(simulated(format!(
                    "detector_library:{}",
                    library
                ))))
            } else {
                bindings
                    .detector_library(library)
                    .ok_or_else(|| McaError::unbound(format!("detector library '{}'", library)))?
            };
            Box::new(
                DetectorLibraryBackend::new(library, *detector_channel)
                    .with_hardware_scas(*hardware_scas),
            )
        }
        BackendConfig::Remote {
            host,
            port,
            record,
            timeout_ms,
        } => {
            if channel.mock {
                let hardware = simulated(format!("remote:{}", record));
                let peer = SimulatedRemotePeer::new(record.clone(), hardware, 0)?;
                Box::new(RemoteProxyBackend::new(Box::new(peer), record.clone()))
            } else {
                let client = TcpFieldClient::connect_with_timeout(
                    host,
                    *port,
                    Duration::from_millis(*timeout_ms),
                )?;
                Box::new(RemoteProxyBackend::new(Box::new(client), record.clone()))
            }
        }
    };

    debug!(
        channel = %channel.id,
        backend = channel.backend.kind(),
        mock = channel.mock,
        "Selected backend"
    );
    Ok(backend)
}
