//! Device adapter capabilities
//!
//! The scan engine never talks to a transport. Anything wrapped by an
//! acquisition object is reached through these small capability traits:
//!
//! - [`Configurable`]: accept a map of acquisition parameters
//! - [`Movable`] / [`Readable`]: perform a blocking move or read
//! - [`StatusReport`]: report ready / busy / error
//!
//! A motor adapter typically implements `Movable + Configurable + StatusReport`,
//! a counter `Readable + Configurable + StatusReport`.
//!
//! Each capability trait is async (`#[async_trait]`), thread-safe
//! (`Send + Sync`) and reports failures with `anyhow::Result`.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Diode { gain: RwLock<f64> }
//!
//! #[async_trait]
//! impl Configurable for Diode {
//!     async fn configure(&self, params: &DeviceParams) -> Result<()> {
//!         if let Some(gain) = params.get("gain").and_then(|v| v.as_f64()) {
//!             *self.gain.write().await = gain;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[async_trait]
//! impl Readable for Diode {
//!     async fn read(&self) -> Result<f64> {
//!         Ok(*self.gain.read().await * 0.5)
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

/// Acquisition parameters handed to a device, keyed by parameter name.
pub type DeviceParams = serde_json::Map<String, serde_json::Value>;

/// Ready/error status reported by a device adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceStatus {
    /// Device can accept the next command
    Ready,
    /// Device is executing a command (moving, integrating)
    Busy,
    /// Device reports an error state
    Fault(String),
}

impl DeviceStatus {
    /// True when the device can take the next command
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Fault(reason) => write!(f, "fault: {}", reason),
        }
    }
}

/// Capability: Parameter Configuration
///
/// Loads acquisition parameters (point count, exposure, trigger mode, ...)
/// before an acquisition segment. Unknown keys should be ignored.
#[async_trait]
pub trait Configurable: Send + Sync {
    /// Apply a set of acquisition parameters
    async fn configure(&self, params: &DeviceParams) -> Result<()>;
}

/// Capability: Status Reporting
#[async_trait]
pub trait StatusReport: Send + Sync {
    /// Current device status
    async fn status(&self) -> Result<DeviceStatus>;
}

/// Capability: Motion Control
///
/// Devices that can move to positions (stages, goniometers, monochromators).
///
/// # Contract
/// - Positions are in device-native units
/// - `move_abs` initiates motion and may return before completion
/// - `wait_settled` blocks until motion completes
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Get current position
    async fn position(&self) -> Result<f64>;

    /// Wait for motion to settle
    async fn wait_settled(&self) -> Result<()>;

    /// Stop motion immediately
    ///
    /// Default implementation returns an error for devices without an abort command.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Scalar Readout
///
/// Devices that produce a single value per acquisition (counters, diodes,
/// power meters).
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read the current value
    async fn read(&self) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Shutter {
        open: Mutex<bool>,
    }

    #[async_trait]
    impl Configurable for Shutter {
        async fn configure(&self, params: &DeviceParams) -> Result<()> {
            if let Some(open) = params.get("open").and_then(|v| v.as_bool()) {
                *self.open.lock().unwrap() = open;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StatusReport for Shutter {
        async fn status(&self) -> Result<DeviceStatus> {
            if *self.open.lock().unwrap() {
                Ok(DeviceStatus::Ready)
            } else {
                Ok(DeviceStatus::Fault("closed".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_configure_then_status() {
        let shutter = Shutter {
            open: Mutex::new(false),
        };
        assert!(!shutter.status().await.unwrap().is_ready());

        let mut params = DeviceParams::new();
        params.insert("open".into(), serde_json::json!(true));
        params.insert("ignored".into(), serde_json::json!(3));
        shutter.configure(&params).await.unwrap();

        assert_eq!(shutter.status().await.unwrap(), DeviceStatus::Ready);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DeviceStatus::Busy.to_string(), "busy");
        assert_eq!(
            DeviceStatus::Fault("limit switch".into()).to_string(),
            "fault: limit switch"
        );
    }
}
