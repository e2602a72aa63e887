//! cairn hardware abstraction layer (HAL).
//!
//! Everything that touches the host (processes, mounts, loop devices,
//! process root) goes through the traits in [`hal`], so the partitioner and
//! the lifecycle actions can run against [`FakeHal`] in tests.

pub mod error;
pub mod hal;
pub mod procfs;

pub use error::{HalError, HalResult};
pub use hal::*;
