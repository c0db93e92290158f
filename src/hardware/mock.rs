//! Simulated device adapters
//!
//! Used by the reusable acquisition objects' tests and by anyone wiring a
//! chain without hardware. All delays use `tokio::time::sleep`.
//!
//! # Available Mocks
//!
//! - `MockStage` - motion stage with speed-proportional move time
//! - `MockCounter` - scalar counter producing a deterministic ramp
//!
//! Both accept an [`InjectedFault`] list to fail a given operation after a
//! number of successful calls.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::hardware::capabilities::{
    Configurable, DeviceParams, DeviceStatus, Movable, Readable, StatusReport,
};

// =============================================================================
// Fault injection
// =============================================================================

/// Fail `operation` once it has succeeded `after` times
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFault {
    /// Operation name ("move", "read", "configure", "status")
    pub operation: &'static str,
    /// Number of successful calls before failures start
    pub after: u32,
}

#[derive(Debug, Default)]
struct FaultState {
    faults: Vec<InjectedFault>,
    counts: HashMap<&'static str, u32>,
}

impl FaultState {
    fn check(&mut self, device: &str, operation: &'static str) -> Result<()> {
        let count = self.counts.entry(operation).or_insert(0);
        *count += 1;
        let count = *count;
        for fault in &self.faults {
            if fault.operation == operation && count > fault.after {
                return Err(anyhow!(
                    "{}: injected {} failure after {} operations",
                    device,
                    operation,
                    fault.after
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// MockStage - Simulated Motion Stage
// =============================================================================

/// Mock motion stage
///
/// Moves at `speed` units/sec (default 1000, so test scans stay fast) and
/// reports `Busy` while moving.
pub struct MockStage {
    name: String,
    position: Arc<RwLock<f64>>,
    speed: Arc<RwLock<f64>>,
    moving: Arc<RwLock<bool>>,
    faults: Mutex<FaultState>,
}

impl MockStage {
    /// Create new mock stage at position 0.0
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: Arc::new(RwLock::new(0.0)),
            speed: Arc::new(RwLock::new(1000.0)),
            moving: Arc::new(RwLock::new(false)),
            faults: Mutex::new(FaultState::default()),
        }
    }

    /// Start at the given position
    pub fn with_position(self, position: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new(position)),
            ..self
        }
    }

    /// Inject a failure
    pub fn with_fault(self, fault: InjectedFault) -> Self {
        self.faults.lock().faults.push(fault);
        self
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Movable for MockStage {
    async fn move_abs(&self, target: f64) -> Result<()> {
        self.faults.lock().check(&self.name, "move")?;
        let current = *self.position.read().await;
        let speed = *self.speed.read().await;
        let delay_ms = ((target - current).abs() / speed * 1000.0) as u64;

        debug!(device = %self.name, from = current, to = target, delay_ms, "moving");
        *self.moving.write().await = true;
        sleep(Duration::from_millis(delay_ms)).await;
        *self.position.write().await = target;
        *self.moving.write().await = false;
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }

    async fn wait_settled(&self) -> Result<()> {
        while *self.moving.read().await {
            sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.moving.write().await = false;
        Ok(())
    }
}

#[async_trait]
impl Configurable for MockStage {
    async fn configure(&self, params: &DeviceParams) -> Result<()> {
        self.faults.lock().check(&self.name, "configure")?;
        if let Some(speed) = params.get("speed").and_then(|v| v.as_f64()) {
            if speed <= 0.0 {
                return Err(anyhow!("{}: speed must be positive", self.name));
            }
            *self.speed.write().await = speed;
        }
        Ok(())
    }
}

#[async_trait]
impl StatusReport for MockStage {
    async fn status(&self) -> Result<DeviceStatus> {
        self.faults.lock().check(&self.name, "status")?;
        if *self.moving.read().await {
            Ok(DeviceStatus::Busy)
        } else {
            Ok(DeviceStatus::Ready)
        }
    }
}

// =============================================================================
// MockCounter - Simulated Scalar Counter
// =============================================================================

/// Mock counter
///
/// Each read returns `offset + gain * n` where `n` counts reads since the last
/// `configure`.
pub struct MockCounter {
    name: String,
    offset: Arc<RwLock<f64>>,
    gain: Arc<RwLock<f64>>,
    reads: Arc<RwLock<u64>>,
    faults: Mutex<FaultState>,
}

impl MockCounter {
    /// Create a counter with offset 0 and gain 1
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            offset: Arc::new(RwLock::new(0.0)),
            gain: Arc::new(RwLock::new(1.0)),
            reads: Arc::new(RwLock::new(0)),
            faults: Mutex::new(FaultState::default()),
        }
    }

    /// Inject a failure
    pub fn with_fault(self, fault: InjectedFault) -> Self {
        self.faults.lock().faults.push(fault);
        self
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of reads since the last configure
    pub async fn read_count(&self) -> u64 {
        *self.reads.read().await
    }
}

#[async_trait]
impl Readable for MockCounter {
    async fn read(&self) -> Result<f64> {
        self.faults.lock().check(&self.name, "read")?;
        let mut reads = self.reads.write().await;
        let value = *self.offset.read().await + *self.gain.read().await * (*reads as f64);
        *reads += 1;
        Ok(value)
    }
}

#[async_trait]
impl Configurable for MockCounter {
    async fn configure(&self, params: &DeviceParams) -> Result<()> {
        self.faults.lock().check(&self.name, "configure")?;
        if let Some(offset) = params.get("offset").and_then(|v| v.as_f64()) {
            *self.offset.write().await = offset;
        }
        if let Some(gain) = params.get("gain").and_then(|v| v.as_f64()) {
            *self.gain.write().await = gain;
        }
        *self.reads.write().await = 0;
        Ok(())
    }
}

#[async_trait]
impl StatusReport for MockCounter {
    async fn status(&self) -> Result<DeviceStatus> {
        self.faults.lock().check(&self.name, "status")?;
        Ok(DeviceStatus::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_stage_move() {
        let stage = MockStage::new("sx").with_position(1.0);
        stage.move_abs(3.5).await.unwrap();
        stage.wait_settled().await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 3.5);
        assert_eq!(stage.status().await.unwrap(), DeviceStatus::Ready);
    }

    #[tokio::test]
    async fn test_mock_stage_rejects_bad_speed() {
        let stage = MockStage::new("sx");
        let mut params = DeviceParams::new();
        params.insert("speed".into(), json!(-1.0));
        assert!(stage.configure(&params).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_counter_ramp() {
        let counter = MockCounter::new("c1");
        let mut params = DeviceParams::new();
        params.insert("offset".into(), json!(10.0));
        params.insert("gain".into(), json!(2.0));
        counter.configure(&params).await.unwrap();

        assert_eq!(counter.read().await.unwrap(), 10.0);
        assert_eq!(counter.read().await.unwrap(), 12.0);
        assert_eq!(counter.read_count().await, 2);
    }

    #[tokio::test]
    async fn test_injected_fault_after_n() {
        let counter = MockCounter::new("c1").with_fault(InjectedFault {
            operation: "read",
            after: 2,
        });
        assert!(counter.read().await.is_ok());
        assert!(counter.read().await.is_ok());
        let err = counter.read().await.unwrap_err();
        assert!(err.to_string().contains("injected read failure"));
    }
}
