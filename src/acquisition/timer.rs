//! Software timer master.
//!
//! Counts for a fixed time per point: opens the count window and triggers
//! its children while it runs, emits the elapsed time since the first point
//! once both are over, then waits for the children to be ready. Works both as a root (timescan, `npoints == 0`
//! for an endless one) and nested under a step master.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::time::{Duration, Instant};

use super::{AcquisitionMaster, AcquisitionParams, SlaveGroup};
use crate::channel::Channel;
use crate::error::ScanError;
use crate::scan::info::ScanMeta;

/// Fixed-time software master
pub struct SoftwareTimerMaster {
    name: String,
    count_time: Duration,
    npoints: u64,
    elapsed: Channel,
    origin: Mutex<Option<Instant>>,
}

impl SoftwareTimerMaster {
    /// Timer counting `count_time` per point for `npoints` points
    pub fn new(name: impl Into<String>, count_time: Duration, npoints: u64) -> Self {
        let name = name.into();
        Self {
            elapsed: Channel::scalar(format!("{}:elapsed_time", name)),
            name,
            count_time,
            npoints,
            origin: Mutex::new(None),
        }
    }

    /// The `elapsed_time` channel
    pub fn elapsed_channel(&self) -> &Channel {
        &self.elapsed
    }

    async fn count(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        let origin = *self.origin.lock().get_or_insert_with(Instant::now);
        // the count window opens before the children are triggered
        let window = tokio::time::sleep(self.count_time);
        tokio::try_join!(
            async {
                window.await;
                Ok::<_, ScanError>(())
            },
            slaves.trigger_slaves(),
        )?;
        self.elapsed.emit(&[origin.elapsed().as_secs_f64()])?;
        slaves.wait_slaves().await?;
        Ok(())
    }
}

#[async_trait]
impl AcquisitionMaster for SoftwareTimerMaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> AcquisitionParams {
        AcquisitionParams::new(self.npoints)
    }

    fn channels(&self) -> Vec<Channel> {
        vec![self.elapsed.clone()]
    }

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        if !slaves.is_root() {
            return Ok(());
        }
        self.count(slaves).await
    }

    async fn trigger(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        self.count(slaves).await
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn fill_meta_at_scan_init(&self, meta: &mut ScanMeta) {
        meta.insert(
            "instrument",
            &self.name,
            json!({ "count_time": self.count_time.as_secs_f64() }),
        );
    }
}
