//! Preset hooks invoked at scan phase boundaries.
//!
//! Presets control ancillary equipment (shutters, multiplexers, interlocks)
//! around a scan without being part of the acquisition chain.
//!
//! - [`ScanPreset`]: `prepare` before any acquisition object is touched,
//!   `start` when the first data-producing action begins, `stop` after every
//!   started object has been stopped.
//! - [`ChainPreset`]: the same three hooks at chain level, plus an optional
//!   [`IterationPreset`] handed out for each scan point.
//!
//! Every preset whose `prepare` was invoked receives `stop`, whatever the
//! outcome of the scan.
//!
//! # Example
//!
//! ```rust,ignore
//! struct FastShutter { shutter: Arc<Shutter> }
//!
//! #[async_trait]
//! impl ScanPreset for FastShutter {
//!     async fn start(&self, _scan: &Scan) -> Result<()> { self.shutter.open().await }
//!     async fn stop(&self, _scan: &Scan) -> Result<()> { self.shutter.close().await }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::Scan;
use crate::chain::AcquisitionChain;

/// Hooks around a whole scan
#[async_trait]
pub trait ScanPreset: Send + Sync {
    /// Before any acquisition object is touched
    async fn prepare(&self, _scan: &Scan) -> Result<()> {
        Ok(())
    }

    /// When the first data-producing action begins
    async fn start(&self, _scan: &Scan) -> Result<()> {
        Ok(())
    }

    /// After all started objects have been stopped
    async fn stop(&self, _scan: &Scan) -> Result<()> {
        Ok(())
    }
}

/// Hooks around one chain run
#[async_trait]
pub trait ChainPreset: Send + Sync {
    /// Before any acquisition object is touched
    async fn prepare(&self, _chain: &AcquisitionChain) -> Result<()> {
        Ok(())
    }

    /// When the first data-producing action begins
    async fn start(&self, _chain: &AcquisitionChain) -> Result<()> {
        Ok(())
    }

    /// After all started objects have been stopped
    async fn stop(&self, _chain: &AcquisitionChain) -> Result<()> {
        Ok(())
    }

    /// Per-point hooks for point `point`, if any
    fn iteration(&self, _point: u64) -> Option<Arc<dyn IterationPreset>> {
        None
    }
}

/// Hooks around one scan point
#[async_trait]
pub trait IterationPreset: Send + Sync {
    /// Before the point's prepare phase
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Before the point's start phase
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// After the point's start phase, or during teardown if the point failed
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}
