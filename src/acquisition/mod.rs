//! Acquisition objects: the participants of a scan.
//!
//! Every node in an acquisition chain implements one of two capability traits:
//!
//! - [`AcquisitionSlave`]: a device that produces data when triggered but never
//!   triggers anything else (counters, detectors, MCAs).
//! - [`AcquisitionMaster`]: a node that owns children and fans triggers out to
//!   them through the [`SlaveGroup`] it receives in `start`/`trigger` (timers,
//!   motor step masters, gate generators).
//!
//! Objects are wrapped in an [`AcqNode`] before they are added to a chain. The
//! node tracks the per-run [`ObjectState`], applies timeouts, records call
//! statistics and guarantees `stop` is issued at most once.
//!
//! # Lifecycle
//!
//! Per scan run: `wait_ready → prepare → start → (trigger)* → stop`. Step
//! masters repeat `wait_ready → prepare → start` once per point; objects that
//! set `prepare_once`/`start_once` are only prepared/started at the first point.
//! A slave's [`reading`](AcquisitionSlave::reading) task runs from its first
//! start until the scan's completion pass joins it.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Diode { data: Channel }
//!
//! #[async_trait]
//! impl AcquisitionSlave for Diode {
//!     fn name(&self) -> &str { "diode" }
//!     fn channels(&self) -> Vec<Channel> { vec![self.data.clone()] }
//!     async fn prepare(&self) -> Result<()> { Ok(()) }
//!     async fn start(&self) -> Result<()> { Ok(()) }
//!     async fn trigger(&self) -> Result<()> {
//!         self.data.emit(&[read_diode().await?])?;
//!         Ok(())
//!     }
//!     async fn stop(&self) -> Result<()> { Ok(()) }
//! }
//!
//! let node = AcqNode::slave(Diode { data: Channel::scalar("diode") });
//! ```

pub mod counter;
pub mod motor;
mod node;
pub mod timer;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::channel::Channel;
use crate::hardware::DeviceParams;
use crate::scan::info::ScanMeta;

pub use node::{AcqNode, SlaveGroup};
pub(crate) use node::RunContext;

/// How an object receives its per-point trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Triggered by its master's `trigger_slaves`
    #[default]
    Software,
    /// Triggered by an external signal; the master only waits for it
    Hardware,
}

/// Timing discipline of a master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    /// One `prepare`/`start`/trigger cycle per scan point
    #[default]
    Step,
    /// A single `prepare`/`start` for the whole segment; children are driven
    /// by hardware and the master waits for completion
    Continuous,
}

/// Per-run state of an acquisition object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ObjectState {
    /// Constructed, not yet touched by a run
    #[default]
    Created,
    /// `wait_ready` completed
    Ready,
    /// `prepare` completed
    Prepared,
    /// `start` completed
    Started,
    /// At least one `trigger` completed since the last start
    Triggered,
    /// `stop` completed
    Stopped,
    /// An unrecoverable error occurred; only a final forced `stop` is accepted
    Faulted,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Ready => write!(f, "READY"),
            Self::Prepared => write!(f, "PREPARED"),
            Self::Started => write!(f, "STARTED"),
            Self::Triggered => write!(f, "TRIGGERED"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Faulted => write!(f, "FAULTED"),
        }
    }
}

/// Acquisition parameters declared by an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionParams {
    /// Number of points; `0` on a step master means "until stopped"
    pub npoints: u64,
    /// Software or hardware triggering
    pub trigger_type: TriggerType,
    /// Only prepare at the first point of a step scan
    pub prepare_once: bool,
    /// Only start at the first point of a step scan
    pub start_once: bool,
    /// Bound applied to each lifecycle call
    #[serde(with = "optional_millis")]
    pub timeout: Option<Duration>,
    /// Device parameters forwarded to the adapter at `prepare`
    pub device: DeviceParams,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            npoints: 1,
            trigger_type: TriggerType::Software,
            prepare_once: false,
            start_once: false,
            timeout: None,
            device: DeviceParams::new(),
        }
    }
}

impl AcquisitionParams {
    /// Parameters for `npoints` software-triggered points
    pub fn new(npoints: u64) -> Self {
        Self {
            npoints,
            ..Default::default()
        }
    }

    /// Set trigger type
    pub fn with_trigger_type(mut self, trigger_type: TriggerType) -> Self {
        self.trigger_type = trigger_type;
        self
    }

    /// Prepare only at the first point
    pub fn with_prepare_once(mut self, prepare_once: bool) -> Self {
        self.prepare_once = prepare_once;
        self
    }

    /// Start only at the first point
    pub fn with_start_once(mut self, start_once: bool) -> Self {
        self.start_once = start_once;
        self
    }

    /// Bound every lifecycle call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a device parameter
    pub fn with_device_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.device.insert(key.to_string(), value);
        self
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Capability: leaf acquisition object
///
/// Produces data into its channels when triggered; never triggers others.
#[async_trait]
pub trait AcquisitionSlave: Send + Sync {
    /// Unique name within a chain
    fn name(&self) -> &str;

    /// Acquisition parameters; read once when the object is wrapped in a node
    fn params(&self) -> AcquisitionParams {
        AcquisitionParams::default()
    }

    /// Channels this object emits into
    fn channels(&self) -> Vec<Channel> {
        Vec::new()
    }

    /// Block until the device can accept the next `prepare`.
    ///
    /// Must be idempotent when already ready.
    async fn wait_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Configure the device for the upcoming segment
    async fn prepare(&self) -> Result<()>;

    /// Arm the device
    async fn start(&self) -> Result<()>;

    /// Acquire one point
    async fn trigger(&self) -> Result<()>;

    /// Background data collection.
    ///
    /// Spawned as a task once the object is started and joined by the final
    /// completion pass of the scan, before `stop`. Hardware-triggered
    /// devices publish their data from here while the segment runs. An
    /// error faults the object. The task is aborted if the scan unwinds
    /// before joining it.
    async fn reading(&self) -> Result<()> {
        Ok(())
    }

    /// Release the device
    async fn stop(&self) -> Result<()>;

    /// Add metadata before the scan runs
    fn fill_meta_at_scan_init(&self, _meta: &mut ScanMeta) {}

    /// Add metadata after the scan ends
    fn fill_meta_at_scan_end(&self, _meta: &mut ScanMeta) {}
}

/// Capability: master acquisition object
///
/// Owns children and triggers them. `start` receives the master's
/// [`SlaveGroup`] and is responsible for calling
/// [`trigger_slaves`](SlaveGroup::trigger_slaves) at the right moment relative
/// to its own hardware action.
#[async_trait]
pub trait AcquisitionMaster: Send + Sync {
    /// Unique name within a chain
    fn name(&self) -> &str;

    /// Acquisition parameters; read once when the object is wrapped in a node
    fn params(&self) -> AcquisitionParams {
        AcquisitionParams::default()
    }

    /// Channels this object emits into
    fn channels(&self) -> Vec<Channel> {
        Vec::new()
    }

    /// Timing discipline
    fn discipline(&self) -> Discipline {
        Discipline::Step
    }

    /// True when this master produces a hardware signal usable by
    /// hardware-triggered children, even though it is step-synchronous
    fn emits_hardware_trigger(&self) -> bool {
        false
    }

    /// Block until the device can accept the next `prepare`
    async fn wait_ready(&self) -> Result<()> {
        Ok(())
    }

    /// Configure the device for the upcoming segment
    async fn prepare(&self) -> Result<()>;

    /// Launch the acquisition.
    ///
    /// The root master fans triggers out to `slaves` here. A nested master is
    /// armed here and acquires when its parent triggers it; check
    /// [`SlaveGroup::is_root`].
    async fn start(&self, slaves: &SlaveGroup<'_>) -> Result<()>;

    /// Triggered by a parent master; defaults to fanning the trigger out
    async fn trigger(&self, slaves: &SlaveGroup<'_>) -> Result<()> {
        slaves.trigger_slaves().await?;
        Ok(())
    }

    /// Release the device
    async fn stop(&self) -> Result<()>;

    /// Add metadata before the scan runs
    fn fill_meta_at_scan_init(&self, _meta: &mut ScanMeta) {}

    /// Add metadata after the scan ends
    fn fill_meta_at_scan_end(&self, _meta: &mut ScanMeta) {}
}
