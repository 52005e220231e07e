//! Async capability adapters over shared controllers.
//!
//! The controller API is blocking, so every call goes through
//! `tokio::task::spawn_blocking` and holds the controller lock only inside the
//! blocking task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::capabilities::{Readable, Settable, Triggerable};
use crate::controller::AcquisitionController;
use crate::derived::{DerivedValue, DerivedValueReader};
use crate::timer::TimerFacade;

pub use crate::timer::SharedController;

/// Prefix selecting a floating-point acquisition value in [`SettableMca`].
pub const ACQUISITION_PREFIX: &str = "acq:";

/// Wrap a controller for sharing between adapters.
pub fn shared(controller: AcquisitionController) -> SharedController {
    Arc::new(Mutex::new(controller))
}

/// Run `f` against the controller on the blocking pool.
async fn with_controller<T, F>(controller: &SharedController, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut AcquisitionController) -> crate::Result<T> + Send + 'static,
{
    let controller = Arc::clone(controller);
    tokio::task::spawn_blocking(move || {
        let mut guard = controller.lock();
        f(&mut guard)
    })
    .await
    .context("Controller task panicked")?
    .map_err(anyhow::Error::from)
}

// =============================================================================
// Readable
// =============================================================================

/// One derived value as a [`Readable`].
#[derive(Debug, Clone)]
pub struct ReadableDerivedValue {
    controller: SharedController,
    reader: DerivedValueReader,
}

impl ReadableDerivedValue {
    /// Read `value` from `controller`.
    pub fn new(controller: SharedController, value: DerivedValue) -> Self {
        Self {
            controller,
            reader: DerivedValueReader::new(value),
        }
    }

    /// The value produced.
    pub fn value(&self) -> &DerivedValue {
        self.reader.value()
    }
}

#[async_trait]
impl Readable for ReadableDerivedValue {
    async fn read(&self) -> Result<f64> {
        let reader = self.reader.clone();
        with_controller(&self.controller, move |c| reader.read(c)).await
    }
}

// =============================================================================
// Settable
// =============================================================================

/// Registers and acquisition values as a [`Settable`].
///
/// Plain names are integer registers. Names starting with
/// [`ACQUISITION_PREFIX`] are floating-point acquisition values, for
/// backends that have them.
#[derive(Debug, Clone)]
pub struct SettableMca {
    controller: SharedController,
}

impl SettableMca {
    /// Adapter over `controller`.
    pub fn new(controller: SharedController) -> Self {
        Self { controller }
    }
}

fn register_value(name: &str, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| anyhow!("Register '{}' needs an unsigned 32-bit integer, got {}", name, value))
}

#[async_trait]
impl Settable for SettableMca {
    async fn set_value(&self, name: &str, value: Value) -> Result<()> {
        if let Some(acq) = name.strip_prefix(ACQUISITION_PREFIX) {
            let number = value
                .as_f64()
                .ok_or_else(|| anyhow!("Acquisition value '{}' needs a number, got {}", acq, value))?;
            let acq = acq.to_string();
            return with_controller(&self.controller, move |c| {
                c.set_acquisition_value(&acq, number)
            })
            .await;
        }

        let register = register_value(name, &value)?;
        let name = name.to_string();
        debug!(parameter = %name, value = register, "Setting register");
        with_controller(&self.controller, move |c| c.write_parameter(&name, register)).await
    }

    async fn get_value(&self, name: &str) -> Result<Value> {
        if let Some(acq) = name.strip_prefix(ACQUISITION_PREFIX) {
            let acq = acq.to_string();
            let number =
                with_controller(&self.controller, move |c| c.get_acquisition_value(&acq)).await?;
            return Ok(Value::from(number));
        }
        let name = name.to_string();
        let register = with_controller(&self.controller, move |c| c.read_parameter(&name)).await?;
        Ok(Value::from(register))
    }
}

// =============================================================================
// Triggerable
// =============================================================================

/// Timer facade as a [`Triggerable`]: arm stores the preset, trigger starts.
#[derive(Debug)]
pub struct TriggerableTimer {
    timer: TimerFacade,
    preset_seconds: Mutex<f64>,
    armed: Mutex<Option<f64>>,
}

impl TriggerableTimer {
    /// Count `preset_seconds` on every trigger.
    pub fn new(timer: TimerFacade, preset_seconds: f64) -> Self {
        Self {
            timer,
            preset_seconds: Mutex::new(preset_seconds),
            armed: Mutex::new(None),
        }
    }

    /// Preset used by the next `arm`.
    pub fn set_preset_seconds(&self, seconds: f64) {
        *self.preset_seconds.lock() = seconds;
    }

    /// Preset used by the next `arm`.
    pub fn preset_seconds(&self) -> f64 {
        *self.preset_seconds.lock()
    }

    /// Underlying timer.
    pub fn timer(&self) -> &TimerFacade {
        &self.timer
    }

    /// True while the channel counts.
    pub async fn is_busy(&self) -> Result<bool> {
        let timer = self.timer.clone();
        tokio::task::spawn_blocking(move || timer.is_busy())
            .await
            .context("Timer task panicked")?
            .map_err(anyhow::Error::from)
    }

    /// Poll until the run ends, then return the elapsed time.
    pub async fn wait_until_idle(&self, timeout: Duration) -> Result<f64> {
        let poll =
            with_controller(self.timer.controller(), |c| Ok(c.retry_policy().busy_poll_interval))
                .await?;
        let deadline = Instant::now() + timeout;
        while self.is_busy().await? {
            if Instant::now() >= deadline {
                anyhow::bail!("Timer still counting after {:.3} s", timeout.as_secs_f64());
            }
            tokio::time::sleep(poll).await;
        }
        let timer = self.timer.clone();
        tokio::task::spawn_blocking(move || timer.last_measurement())
            .await
            .context("Timer task panicked")?
            .map_err(anyhow::Error::from)
    }
}

#[async_trait]
impl Triggerable for TriggerableTimer {
    async fn arm(&self) -> Result<()> {
        let seconds = self.preset_seconds();
        if !seconds.is_finite() || seconds < 0.0 {
            anyhow::bail!("Invalid preset {} s", seconds);
        }
        *self.armed.lock() = Some(seconds);
        debug!(seconds, "Timer armed");
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        let seconds = self
            .armed
            .lock()
            .take()
            .ok_or_else(|| anyhow!("Timer not armed"))?;
        let timer = self.timer.clone();
        tokio::task::spawn_blocking(move || timer.start(seconds))
            .await
            .context("Timer task panicked")?
            .map_err(anyhow::Error::from)
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.armed.lock().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_value_bounds() {
        assert_eq!(register_value("GAIN", &Value::from(12)).unwrap(), 12);
        assert!(register_value("GAIN", &Value::from(-1)).is_err());
        assert!(register_value("GAIN", &Value::from(1.5)).is_err());
        assert!(register_value("GAIN", &Value::from(u64::from(u32::MAX) + 1)).is_err());
    }
}
