//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for system operations and provides
//! both real (LinuxHal) and fake (FakeHal) implementations.

pub mod copy_ops;
pub mod fake_hal;
pub mod guards;
pub mod host_info_ops;
pub mod linux_hal;
pub mod loop_ops;
pub mod mount_ops;
pub mod process_ops;
pub mod syscall_ops;

pub use copy_ops::{CopyOps, CopyOptions};
pub use fake_hal::{FakeHal, Operation, SideEffect};
pub use guards::{LoopGuard, MountGuard};
pub use host_info_ops::HostInfoOps;
pub use linux_hal::LinuxHal;
pub use loop_ops::LoopOps;
pub use mount_ops::{MountOps, MountOptions};
pub use process_ops::{ProcessOps, DEFAULT_COMMAND_TIMEOUT};
pub use syscall_ops::SyscallOps;

/// Complete HAL combining all system operation traits.
pub trait SystemHal:
    ProcessOps + MountOps + LoopOps + CopyOps + SyscallOps + HostInfoOps + Send + Sync
{
}

/// Automatically implement SystemHal for any type implementing all required traits.
impl<T> SystemHal for T where
    T: ProcessOps + MountOps + LoopOps + CopyOps + SyscallOps + HostInfoOps + Send + Sync
{
}
