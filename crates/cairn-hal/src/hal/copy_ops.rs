//! Directory tree copy.

use crate::HalResult;
use std::path::Path;

/// Options controlling how trees are copied.
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Top-level paths (relative to the source root) that are skipped.
    pub excludes: Vec<String>,
}

impl CopyOptions {
    /// Archive-style copy of a whole tree.
    pub fn archive() -> Self {
        Self::default()
    }

    /// Skip the pseudo-filesystem and runtime directories of a root tree.
    pub fn system_tree() -> Self {
        Self {
            excludes: ["mnt", "proc", "sys", "dev", "tmp", "host", "run"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Copy operations abstraction.
pub trait CopyOps {
    /// Recursively copy the contents of `src` into `dst`, preserving ownership,
    /// permissions, hard links, ACLs and xattrs.
    fn copy_tree(&self, src: &Path, dst: &Path, opts: &CopyOptions) -> HalResult<()>;
}
