//! Process root switching (chroot/chdir).

use crate::HalResult;
use std::fs::File;
use std::path::Path;

pub trait SyscallOps {
    fn chroot(&self, path: &Path) -> HalResult<()>;

    fn chdir(&self, path: &Path) -> HalResult<()>;

    /// Change the working directory to an already opened directory.
    fn fchdir(&self, dir: &File) -> HalResult<()>;
}
