//! # DAQ Scan Engine
//!
//! Acquisition chain engine for step and continuous scans. Heterogeneous
//! acquisition objects (motors, counters, detectors, timers) are arranged in a
//! master/slave tree; a [`Scan`] drives that tree through a strict lifecycle,
//! collects per-point data into named [`Channel`]s and shuts every started
//! object down whatever happens.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the [`AcquisitionMaster`] / [`AcquisitionSlave`]
//!   capability traits, the [`AcqNode`] wrapper, and reusable objects
//!   (software timer, motor step master, counter slave).
//! - **`chain`**: [`ChainBuilder`] and the validated [`AcquisitionChain`]
//!   with its level-by-level execution plan.
//! - **`channel`**: append-only typed data streams with subscribers.
//! - **`scan`**: the [`Scan`] driver, presets, watchdog, statistics, scan
//!   metadata and the data view with alignment helpers.
//! - **`barrier`**: run a level of calls concurrently and wait for all.
//! - **`hardware`**: device capability traits consumed by acquisition
//!   objects, plus mock adapters.
//! - **`config`**: figment-based configuration (TOML file + `DAQ_SCAN_` env).
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: [`ChainError`], [`ChannelError`] and [`ScanError`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let stage = Arc::new(MockStage::new("sx"));
//! let counter = Arc::new(MockCounter::new("diode"));
//!
//! let motor = AcqNode::master(StepTriggerMaster::new("sx", stage, 0.0, 1.0, 11));
//! let timer = AcqNode::master(SoftwareTimerMaster::new("timer", Duration::from_millis(10), 1));
//! let diode = AcqNode::slave(ReadableSlave::new("diode", counter));
//!
//! let mut builder = ChainBuilder::new();
//! builder.add(&motor, &timer)?.add(&timer, &diode)?;
//! let chain = builder.build()?;
//!
//! let scan = Scan::new("ascan", chain)?;
//! let report = scan.run().await?;
//! let (x, y) = scan.data().peak("axis:sx", "diode").unwrap_or_default();
//! ```

pub mod acquisition;
pub mod barrier;
pub mod chain;
pub mod channel;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod scan;

pub use acquisition::counter::ReadableSlave;
pub use acquisition::motor::StepTriggerMaster;
pub use acquisition::timer::SoftwareTimerMaster;
pub use acquisition::{
    AcqNode, AcquisitionMaster, AcquisitionParams, AcquisitionSlave, Discipline, ObjectState,
    SlaveGroup, TriggerType,
};
pub use chain::{AcquisitionChain, ChainBuilder, ExecutionPlan, NodeId};
pub use channel::{Channel, ChannelUpdate, DType, SubscriptionId};
pub use config::ScanConfig;
pub use error::{ChainError, ChannelError, Operation, ScanError, ScanResult};
pub use scan::{
    ChainPreset, IterationPreset, Scan, ScanData, ScanInfo, ScanInterruptHandle, ScanMeta,
    ScanOutcome, ScanPreset, ScanReport, ScanState, ScanStatistics, Watchdog, WatchdogVerdict,
};
