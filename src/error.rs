//! Error types for the scan engine.
//!
//! Device adapters and acquisition objects report failures with `anyhow::Result`,
//! the same way the hardware capability traits do. The engine turns those into
//! the typed [`ScanError`] at the boundary of each lifecycle call so the scan
//! driver can tell a structural problem from a device fault, a timeout or an
//! operator interrupt.
//!
//! ## Error Hierarchy
//!
//! - **`Structural`**: the chain is malformed ([`ChainError`]). Raised at `run()`
//!   entry before any hardware is touched.
//! - **`ChainReused` / `ScanReused`**: single-use objects asked to run again.
//! - **`DeviceFault`**: an acquisition object returned an error from a lifecycle call.
//! - **`Timeout`**: a lifecycle call exceeded its per-object bound.
//! - **`ObjectFaulted`**: a call was issued on an object that already faulted.
//! - **`Preset`**: a preset hook failed.
//! - **`Watchdog`**: the watchdog asked for a hard stop.
//! - **`Interrupted`**: the operator interrupted the scan.
//! - **`Channel`**: a data channel rejected an emission ([`ChannelError`]).

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Lifecycle operation that was being performed when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    /// `wait_ready`
    WaitReady,
    /// `prepare`
    Prepare,
    /// `start`
    Start,
    /// `trigger`
    Trigger,
    /// `stop`
    Stop,
    /// The background reading task of a slave
    Reading,
    /// A master fanning triggers out to its children.
    TriggerSlaves,
    /// A master waiting for its children to become ready.
    WaitSlaves,
}

impl Operation {
    /// Name used in logs and statistics keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitReady => "wait_ready",
            Self::Prepare => "prepare",
            Self::Start => "start",
            Self::Trigger => "trigger",
            Self::Stop => "stop",
            Self::Reading => "reading",
            Self::TriggerSlaves => "trigger_slaves",
            Self::WaitSlaves => "wait_slaves",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a preset hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetPhase {
    /// Before any acquisition object is touched.
    Prepare,
    /// When the first data-producing action begins.
    Start,
    /// After every started object has been stopped.
    Stop,
}

impl fmt::Display for PresetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Structural problems in an acquisition chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Acquisition chain is empty")]
    Empty,

    #[error("Acquisition chain has multiple roots: {0:?}")]
    MultipleRoots(Vec<String>),

    #[error("'{child}' already has parent '{parent}'")]
    AlreadyHasParent { child: String, parent: String },

    #[error("Adding '{child}' under '{master}' would create a cycle")]
    Cycle { master: String, child: String },

    #[error("Duplicate acquisition object name '{0}'")]
    DuplicateName(String),

    #[error("'{0}' is not a master and cannot own children")]
    NotAMaster(String),

    #[error("'{0}' belongs to another acquisition chain")]
    ForeignNode(String),

    #[error("'{child}' needs a hardware trigger but its parent '{parent}' is step-synchronous")]
    IncompatibleTiming { parent: String, child: String },
}

/// Errors raised by a data channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel '{0}' is sealed")]
    Sealed(String),

    #[error("Channel '{name}' expects batches of {sample_size} values, got {len}")]
    RaggedBatch {
        name: String,
        sample_size: usize,
        len: usize,
    },

    #[error("Invalid range {from}..{to} on channel '{name}'")]
    InvalidRange { name: String, from: usize, to: usize },
}

/// Primary error type of the scan engine.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid acquisition chain: {0}")]
    Structural(#[from] ChainError),

    #[error("Acquisition chain has already been run")]
    ChainReused,

    #[error("Scan '{0}' has already been run")]
    ScanReused(String),

    #[error("Device fault in '{object}' during {operation}: {source:#}")]
    DeviceFault {
        object: String,
        operation: Operation,
        #[source]
        source: anyhow::Error,
    },

    #[error("'{object}' timed out after {timeout:?} during {operation}")]
    Timeout {
        object: String,
        operation: Operation,
        timeout: Duration,
    },

    #[error("'{object}' is faulted and rejects {operation}")]
    ObjectFaulted { object: String, operation: Operation },

    #[error("Preset {phase} hook failed: {source:#}")]
    Preset {
        phase: PresetPhase,
        #[source]
        source: anyhow::Error,
    },

    #[error("Watchdog stopped the scan: {0}")]
    Watchdog(String),

    #[error("Scan interrupted")]
    Interrupted,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl ScanError {
    /// Wrap an adapter failure raised during `operation` on `object`.
    ///
    /// A `ScanError` travelling back up through a master's hook (for example a
    /// child fault surfacing from `trigger_slaves`) is returned unchanged so the
    /// object that actually failed stays the one reported.
    pub fn device(object: &str, operation: Operation, source: anyhow::Error) -> Self {
        match source.downcast::<ScanError>() {
            Ok(inner) => inner,
            Err(source) => Self::DeviceFault {
                object: object.to_string(),
                operation,
                source,
            },
        }
    }

    /// True for errors rejected before any hardware I/O.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Structural(_) | Self::ChainReused | Self::ScanReused(_)
        )
    }

    /// True for errors that end a run in the faulted state.
    pub fn is_fault(&self) -> bool {
        !self.is_structural() && !matches!(self, Self::Interrupted)
    }

    /// Name of the acquisition object the error is attributed to, if any.
    pub fn object(&self) -> Option<&str> {
        match self {
            Self::DeviceFault { object, .. }
            | Self::Timeout { object, .. }
            | Self::ObjectFaulted { object, .. } => Some(object),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_error_conversion() {
        let err: ScanError = ChainError::Empty.into();
        assert!(matches!(err, ScanError::Structural(ChainError::Empty)));
        assert!(err.is_structural());
        assert!(!err.is_fault());
    }

    #[test]
    fn test_device_fault_display() {
        let err = ScanError::device("x", Operation::Trigger, anyhow::anyhow!("bus error"));
        assert_eq!(err.object(), Some("x"));
        assert!(err.is_fault());
        assert_eq!(
            err.to_string(),
            "Device fault in 'x' during trigger: bus error"
        );
    }

    #[test]
    fn test_device_keeps_nested_scan_error() {
        let inner = ScanError::Timeout {
            object: "x".into(),
            operation: Operation::Trigger,
            timeout: Duration::from_millis(5),
        };
        let err = ScanError::device("m", Operation::Start, anyhow::Error::new(inner));
        assert_eq!(err.object(), Some("x"));
        assert!(matches!(err, ScanError::Timeout { .. }));
    }

    #[test]
    fn test_interrupted_is_not_fault() {
        assert!(!ScanError::Interrupted.is_fault());
        assert!(!ScanError::Interrupted.is_structural());
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::WaitReady.to_string(), "wait_ready");
        assert_eq!(Operation::TriggerSlaves.as_str(), "trigger_slaves");
    }
}
