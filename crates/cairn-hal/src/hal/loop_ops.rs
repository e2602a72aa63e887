//! Loop device operations (losetup).

use crate::HalResult;
use std::path::Path;

pub trait LoopOps {
    /// Attach a loop device to the given image file, returning the loop path (e.g. `/dev/loop7`).
    fn losetup_attach(&self, image: &Path) -> HalResult<String>;

    /// Detach a loop device.
    fn losetup_detach(&self, loop_device: &str) -> HalResult<()>;
}
