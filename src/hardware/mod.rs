//! Device adapter interface consumed by acquisition objects.
//!
//! - `capabilities`: capability traits a device adapter implements
//! - `mock`: simulated adapters for tests and dry runs

pub mod capabilities;
pub mod mock;

pub use capabilities::{Configurable, DeviceParams, DeviceStatus, Movable, Readable, StatusReport};
