//! Async capability traits for front ends.
//!
//! Scan engines and record layers talk to MCA channels through small,
//! focused traits instead of the controller itself:
//!
//! - a derived value is [`Readable`]
//! - a channel's registers and acquisition values are [`Settable`]
//! - a channel counting for a preset time is [`Triggerable`]
//!
//! Each trait is async (`#[async_trait]`), `Send + Sync`, and reports errors
//! as `anyhow::Result`. Implementations live in [`crate::hal`].
//!
//! # Example
//!
//! ```rust,ignore
//! async fn count_and_read<T, R>(timer: &T, roi: &R) -> anyhow::Result<f64>
//! where
//!     T: Triggerable,
//!     R: Readable,
//! {
//!     timer.arm().await?;
//!     timer.trigger().await?;
//!     roi.read().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

/// Capability: scalar readout.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read the current value.
    async fn read(&self) -> Result<f64>;
}

/// Capability: named parameters.
///
/// # Contract
/// - Integer registers take JSON integers
/// - Acquisition values take JSON numbers
#[async_trait]
pub trait Settable: Send + Sync {
    /// Set `name` to `value`.
    async fn set_value(&self, name: &str, value: serde_json::Value) -> Result<()>;

    /// Current value of `name`.
    async fn get_value(&self, name: &str) -> Result<serde_json::Value> {
        anyhow::bail!("Get value for '{}' not supported by this device", name)
    }
}

/// Capability: arm and trigger.
///
/// # Contract
/// - `arm()` prepares the device; `trigger()` starts it
/// - `trigger()` on an unarmed device returns Err
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Prepare for a trigger.
    async fn arm(&self) -> Result<()>;

    /// Start the armed acquisition.
    async fn trigger(&self) -> Result<()>;

    /// Whether the device is armed.
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_armed(&self) -> Result<bool> {
        anyhow::bail!("Armed state query not supported by this device")
    }
}
