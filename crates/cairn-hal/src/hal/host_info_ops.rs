//! Host information (read-only).
//!
//! This is "world-touching" (reads `/proc`, `/sys`) and belongs in the HAL.

use crate::HalResult;

pub trait HostInfoOps {
    fn proc_cmdline(&self) -> HalResult<String>;

    /// Whether the host booted through UEFI firmware.
    fn efi_firmware(&self) -> bool;
}
