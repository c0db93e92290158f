//! Slave reading a scalar [`Readable`] device once per trigger.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{AcquisitionParams, AcquisitionSlave};
use crate::channel::Channel;
use crate::hardware::{Configurable, DeviceStatus, Readable, StatusReport};
use crate::scan::info::ScanMeta;

const STATUS_POLL: Duration = Duration::from_millis(1);

/// Counter slave: one read per trigger, emitted on a channel named after it.
///
/// Prepared and started once per scan; only `trigger` repeats.
pub struct ReadableSlave<D> {
    name: String,
    device: Arc<D>,
    channel: Channel,
    params: AcquisitionParams,
}

impl<D> ReadableSlave<D>
where
    D: Readable + Configurable + StatusReport,
{
    /// Wrap `device`
    pub fn new(name: impl Into<String>, device: Arc<D>) -> Self {
        let name = name.into();
        Self {
            channel: Channel::scalar(name.clone()),
            name,
            device,
            params: AcquisitionParams::default()
                .with_prepare_once(true)
                .with_start_once(true),
        }
    }

    /// Override acquisition parameters (device parameters are sent at `prepare`)
    pub fn with_params(mut self, params: AcquisitionParams) -> Self {
        self.params = params;
        self
    }

    /// The value channel
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl<D> AcquisitionSlave for ReadableSlave<D>
where
    D: Readable + Configurable + StatusReport + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> AcquisitionParams {
        self.params.clone()
    }

    fn channels(&self) -> Vec<Channel> {
        vec![self.channel.clone()]
    }

    async fn wait_ready(&self) -> Result<()> {
        loop {
            match self.device.status().await? {
                DeviceStatus::Ready => return Ok(()),
                DeviceStatus::Busy => tokio::time::sleep(STATUS_POLL).await,
                DeviceStatus::Fault(reason) => bail!("{} reports fault: {}", self.name, reason),
            }
        }
    }

    async fn prepare(&self) -> Result<()> {
        self.device.configure(&self.params.device).await
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        let value = self.device.read().await?;
        self.channel.emit(&[value])?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn fill_meta_at_scan_init(&self, meta: &mut ScanMeta) {
        if !self.params.device.is_empty() {
            meta.insert(
                "instrument",
                &self.name,
                serde_json::Value::Object(self.params.device.clone()),
            );
        }
    }
}
