//! Mount operations trait.

use crate::HalResult;
use nix::mount::MsFlags;
use std::path::Path;

/// Trait for mounting and unmounting filesystems.
pub trait MountOps {
    /// Mount a device to a target path.
    ///
    /// # Arguments
    /// * `device` - Device path (e.g., `/dev/sda1`) or bind source
    /// * `target` - Mount point path
    /// * `fstype` - Optional filesystem type (e.g., `"ext4"`, `"vfat"`)
    /// * `options` - Mount options
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &MountOptions,
    ) -> HalResult<()>;

    /// Unmount a filesystem.
    fn unmount(&self, target: &Path) -> HalResult<()>;

    /// Check if a path is currently a mount point.
    fn is_mounted(&self, path: &Path) -> HalResult<bool>;
}

/// Mount options in `mount(8)` notation, e.g. `["ro"]` or `["remount", "rw"]`.
///
/// Flag-like options are translated into `MsFlags`; anything else is passed
/// to the filesystem as mount data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub options: Vec<String>,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_list<S: AsRef<str>>(opts: &[S]) -> Self {
        Self {
            options: opts
                .iter()
                .flat_map(|o| o.as_ref().split(','))
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    pub fn bind() -> Self {
        Self::from_list(&["bind"])
    }

    pub fn contains(&self, opt: &str) -> bool {
        self.options.iter().any(|o| o == opt)
    }

    /// Split options into kernel mount flags and a data string.
    pub fn to_flags_and_data(&self) -> (MsFlags, Option<String>) {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();
        for opt in &self.options {
            match opt.as_str() {
                "ro" => flags |= MsFlags::MS_RDONLY,
                "rw" | "defaults" | "loop" => {}
                "remount" => flags |= MsFlags::MS_REMOUNT,
                "bind" => flags |= MsFlags::MS_BIND,
                "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                "noatime" => flags |= MsFlags::MS_NOATIME,
                "relatime" => flags |= MsFlags::MS_RELATIME,
                "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
                other => data.push(other.to_string()),
            }
        }
        let data = if data.is_empty() {
            None
        } else {
            Some(data.join(","))
        };
        (flags, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_data_are_split() {
        let opts = MountOptions::from_list(&["remount,ro", "discard"]);
        let (flags, data) = opts.to_flags_and_data();
        assert!(flags.contains(MsFlags::MS_REMOUNT));
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(data.as_deref(), Some("discard"));
    }

    #[test]
    fn rw_has_no_flags() {
        let (flags, data) = MountOptions::from_list(&["rw"]).to_flags_and_data();
        assert!(flags.is_empty());
        assert!(data.is_none());
    }
}
