//! Lifecycle actions of cairn: install, reset and upgrade.
//!
//! Every action follows the same shape: a before hook, resource
//! acquisition with a cleanup job pushed for each resource, deployment,
//! the chroot and after hooks, finalization, a full drain of the cleanup
//! stack and an optional reboot or poweroff.

pub mod common;
pub mod install;
pub mod reset;
pub mod upgrade;

pub use install::InstallAction;
pub use reset::ResetAction;
pub use upgrade::UpgradeAction;
