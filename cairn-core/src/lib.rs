//! cairn core library.
//!
//! `cairn-core` holds the value types, runtime config and the building blocks
//! (partitioner, deployer, chroot, hooks, bootloader) that the lifecycle
//! actions in `cairn-workflow` are sequenced from.

pub mod chroot;
pub mod cleanup;
pub mod config;
pub mod constants;
pub mod deployer;
pub mod errors;
pub mod fetch;
pub mod grub;
pub mod hooks;
pub mod install_state;
pub mod logging;
pub mod partitioner;
pub mod partitions;
pub mod specs;
pub mod types;
pub mod unpack;

pub use config::{Config, ConfigFile, RunConfig};
pub use errors::{CairnError, ErrorKind, Result};
