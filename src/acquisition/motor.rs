//! Step trigger master driving a [`Movable`] device.
//!
//! At each point the motor moves to the next position, the reached position
//! is emitted on the axis channel, then the children are triggered and waited
//! for. This is the top master of absolute step scans.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use super::{AcquisitionMaster, AcquisitionParams, SlaveGroup};
use crate::channel::Channel;
use crate::hardware::Movable;
use crate::scan::info::ScanMeta;

/// `npoints` evenly spaced values from `start` to `stop`, both included.
pub fn linspace(start: f64, stop: f64, npoints: usize) -> Vec<f64> {
    match npoints {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Step master moving one axis through a list of positions
pub struct StepTriggerMaster<M: Movable> {
    name: String,
    motor: Arc<M>,
    positions: Vec<f64>,
    axis: Channel,
}

impl<M: Movable> StepTriggerMaster<M> {
    /// Move `motor` from `start` to `stop` in `npoints` points
    pub fn new(name: impl Into<String>, motor: Arc<M>, start: f64, stop: f64, npoints: usize) -> Self {
        Self::with_positions(name, motor, linspace(start, stop, npoints))
    }

    /// Move `motor` through explicit positions
    pub fn with_positions(name: impl Into<String>, motor: Arc<M>, positions: Vec<f64>) -> Self {
        let name = name.into();
        Self {
            axis: Channel::scalar(format!("axis:{}", name)),
            name,
            motor,
            positions,
        }
    }

    /// Planned positions
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    /// The axis channel
    pub fn axis_channel(&self) -> &Channel {
        &self.axis
    }

    async fn step(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        let target = usize::try_from(slaves.point())
            .ok()
            .and_then(|point| self.positions.get(point).copied())
            .ok_or_else(|| anyhow!("{}: point {} out of range", self.name, slaves.point()))?;

        self.motor.move_abs(target).await?;
        self.motor.wait_settled().await?;
        self.axis.emit(&[self.motor.position().await?])?;

        slaves.trigger_slaves().await?;
        slaves.wait_slaves().await?;
        Ok(())
    }
}

#[async_trait]
impl<M: Movable + 'static> AcquisitionMaster for StepTriggerMaster<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> AcquisitionParams {
        AcquisitionParams::new(self.positions.len() as u64)
    }

    fn channels(&self) -> Vec<Channel> {
        vec![self.axis.clone()]
    }

    async fn wait_ready(&self) -> Result<()> {
        self.motor.wait_settled().await
    }

    async fn prepare(&self) -> Result<()> {
        if self.positions.is_empty() {
            return Err(anyhow!("{}: no positions to scan", self.name));
        }
        Ok(())
    }

    async fn start(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        if !slaves.is_root() {
            return Ok(());
        }
        self.step(slaves).await
    }

    async fn trigger(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        self.step(slaves).await
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn fill_meta_at_scan_init(&self, meta: &mut ScanMeta) {
        let first = self.positions.first().copied();
        let last = self.positions.last().copied();
        meta.insert(
            "positioners",
            &self.name,
            json!({ "start": first, "stop": last, "npoints": self.positions.len() }),
        );
    }
}
