//! Parameters of the install, reset and upgrade actions.
//!
//! Each spec is built by a constructor that fills in the default layout,
//! labels and mount points, then adjusted by the caller and checked with
//! `sanitize()` before the action runs.

use crate::config::Config;
use crate::constants;
use crate::errors::{err, CairnError, ErrorKind, Result};
use crate::partitions;
use crate::types::{Firmware, Image, ImageSource, Partition, PartitionLayout};
use std::path::{Path, PathBuf};

fn mount_point_of(part: &Option<Partition>, default: &str) -> PathBuf {
    part.as_ref()
        .and_then(|p| p.mount_point.clone())
        .unwrap_or_else(|| PathBuf::from(default))
}

#[derive(Debug, Clone)]
pub struct InstallSpec {
    pub target: String,
    pub firmware: Firmware,
    pub part_table: String,
    pub partitions: PartitionLayout,
    pub extra_partitions: Vec<Partition>,
    pub no_format: bool,
    pub force: bool,
    /// Cloud-init files copied to the OEM partition.
    pub cloud_init: Vec<String>,
    pub tty: Option<String>,
    pub grub_default_entry: String,
    pub active: Image,
    pub recovery: Image,
    pub passive: Image,
}

impl InstallSpec {
    pub fn new(cfg: &Config, target: &str) -> Self {
        let state_dir = Path::new(constants::STATE_DIR);
        let recovery_dir = Path::new(constants::RECOVERY_DIR);
        Self {
            target: target.to_string(),
            firmware: cfg.firmware,
            part_table: constants::GPT.to_string(),
            partitions: PartitionLayout::with_defaults(),
            extra_partitions: Vec::new(),
            no_format: false,
            force: false,
            cloud_init: Vec::new(),
            tty: cfg.tty.clone(),
            grub_default_entry: cfg
                .grub_default_entry
                .clone()
                .unwrap_or_else(|| "cOS".to_string()),
            active: Image::new(
                constants::img_path(state_dir, constants::ACTIVE_IMG_FILE),
                constants::ACTIVE_LABEL,
                constants::LINUX_IMG_FS,
                constants::ACTIVE_DIR,
            ),
            recovery: Image::new(
                constants::img_path(recovery_dir, constants::RECOVERY_IMG_FILE),
                constants::SYSTEM_LABEL,
                constants::LINUX_IMG_FS,
                constants::TRANSITION_DIR,
            ),
            passive: Image::new(
                constants::img_path(state_dir, constants::PASSIVE_IMG_FILE),
                constants::PASSIVE_LABEL,
                constants::LINUX_IMG_FS,
                constants::PASSIVE_DIR,
            ),
        }
    }

    /// Use a squashfs recovery image instead of an ext2 one.
    pub fn set_squashfs_recovery(&mut self) {
        self.recovery.fs = constants::SQUASH_FS.to_string();
        self.recovery.file = self
            .recovery
            .file
            .with_file_name(constants::RECOVERY_SQUASH_FILE);
    }

    /// Check the spec and derive the dependent settings.
    ///
    /// Sets the boot-firmware partitions, makes recovery default to a copy
    /// of active and passive always one.
    pub fn sanitize(&mut self) -> Result<()> {
        if self.target.is_empty() {
            return Err(err(ErrorKind::InvalidTarget, "no target device given"));
        }
        if self.active.source.is_empty() {
            return Err(err(
                ErrorKind::InvalidFlags,
                "undefined system source to install",
            ));
        }
        let active_file = ImageSource::File(self.active.file.clone());
        if self.recovery.source.is_empty() {
            self.recovery.source = active_file.clone();
        }
        self.passive.source = active_file;

        if self.partitions.state.is_none() {
            return Err(err(ErrorKind::MissingPartition, "no state partition defined"));
        }
        self.partitions
            .set_firmware_partitions(self.firmware, &self.part_table)?;
        // rejects layouts with more than one zero-size partition
        self.partitions
            .partitions_by_install_order(&self.extra_partitions)?;
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        mount_point_of(&self.partitions.state, constants::STATE_DIR)
    }

    pub fn recovery_dir(&self) -> PathBuf {
        mount_point_of(&self.partitions.recovery, constants::RECOVERY_DIR)
    }
}

#[derive(Debug, Clone)]
pub struct ResetSpec {
    pub target: String,
    pub efi: bool,
    /// Also format Persistent and OEM.
    pub format_persistent: bool,
    pub format_oem: bool,
    pub partitions: PartitionLayout,
    pub tty: Option<String>,
    pub grub_default_entry: String,
    pub active: Image,
    pub passive: Image,
}

/// Fails unless the running system is the recovery system.
pub fn ensure_recovery_boot(cfg: &Config) -> Result<()> {
    let hal = &*cfg.hal;
    if partitions::booted_from(hal, constants::RECOVERY_SQUASH_FILE)
        || partitions::booted_from(hal, constants::SYSTEM_LABEL)
    {
        return Ok(());
    }
    Err(CairnError::new(ErrorKind::ResetNotFromRecovery).into())
}

impl ResetSpec {
    /// Discover the installed layout and default to redeploying the running recovery.
    pub fn new(cfg: &Config) -> Result<Self> {
        ensure_recovery_boot(cfg)?;
        let hal = &*cfg.hal;

        let source = if partitions::booted_from(hal, constants::RECOVERY_SQUASH_FILE) {
            ImageSource::Dir(PathBuf::from(constants::ISO_BASE_TREE))
        } else {
            ImageSource::File(constants::img_path(
                Path::new(constants::RUNNING_STATE_DIR),
                constants::RECOVERY_IMG_FILE,
            ))
        };

        let mut layout = partitions::layout_from_labels(hal)?;
        if cfg.firmware != Firmware::Efi {
            layout.efi = None;
        }
        let state = layout
            .state
            .clone()
            .ok_or_else(|| err(ErrorKind::MissingPartition, "state partition not found"))?;
        if layout.oem.is_none() {
            log::warn!("No OEM partition found");
        }
        if layout.persistent.is_none() {
            log::warn!("No Persistent partition found");
        }
        let state_dir = mount_point_of(&layout.state, constants::STATE_DIR);

        let active = Image::new(
            constants::img_path(&state_dir, constants::ACTIVE_IMG_FILE),
            constants::ACTIVE_LABEL,
            constants::LINUX_IMG_FS,
            constants::ACTIVE_DIR,
        )
        .with_source(source);
        let passive = Image::new(
            constants::img_path(&state_dir, constants::PASSIVE_IMG_FILE),
            constants::PASSIVE_LABEL,
            constants::LINUX_IMG_FS,
            constants::PASSIVE_DIR,
        )
        .with_source(ImageSource::File(active.file.clone()));

        Ok(Self {
            target: state.disk.unwrap_or_default(),
            efi: cfg.firmware == Firmware::Efi,
            format_persistent: false,
            format_oem: false,
            partitions: layout,
            tty: cfg.tty.clone(),
            grub_default_entry: cfg
                .grub_default_entry
                .clone()
                .unwrap_or_else(|| "cOS".to_string()),
            active,
            passive,
        })
    }

    pub fn sanitize(&mut self) -> Result<()> {
        if self.partitions.state.is_none() {
            return Err(err(ErrorKind::MissingPartition, "state partition not found"));
        }
        if self.active.source.is_empty() {
            return Err(err(ErrorKind::InvalidFlags, "undefined system source to reset to"));
        }
        self.passive.source = ImageSource::File(self.active.file.clone());
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        mount_point_of(&self.partitions.state, constants::STATE_DIR)
    }

    pub fn recovery_dir(&self) -> PathBuf {
        mount_point_of(&self.partitions.recovery, constants::RECOVERY_DIR)
    }
}

#[derive(Debug, Clone)]
pub struct UpgradeSpec {
    /// Upgrade the recovery image instead of active.
    pub recovery_upgrade: bool,
    pub partitions: PartitionLayout,
    pub active: Image,
    pub recovery: Image,
}

impl UpgradeSpec {
    pub fn new(cfg: &Config) -> Result<Self> {
        let layout = partitions::layout_from_labels(&*cfg.hal)?;
        let state_dir = mount_point_of(&layout.state, constants::STATE_DIR);
        let recovery_dir = mount_point_of(&layout.recovery, constants::RECOVERY_DIR);

        let active = Image::new(
            constants::img_path(&state_dir, constants::ACTIVE_IMG_FILE),
            constants::ACTIVE_LABEL,
            constants::LINUX_IMG_FS,
            constants::TRANSITION_DIR,
        );

        let squash = constants::img_path(&recovery_dir, constants::RECOVERY_SQUASH_FILE);
        let recovery = if squash.exists() {
            log::debug!("Recovery is squash");
            Image::new(
                squash,
                constants::SYSTEM_LABEL,
                constants::SQUASH_FS,
                constants::TRANSITION_DIR,
            )
        } else {
            Image::new(
                constants::img_path(&recovery_dir, constants::RECOVERY_IMG_FILE),
                constants::SYSTEM_LABEL,
                constants::LINUX_IMG_FS,
                constants::TRANSITION_DIR,
            )
        };

        Ok(Self {
            recovery_upgrade: false,
            partitions: layout,
            active,
            recovery,
        })
    }

    /// Set the content source of the image being upgraded.
    pub fn set_source(&mut self, source: ImageSource) {
        self.active.source = source.clone();
        self.recovery.source = source;
    }

    /// The partition holding the image being upgraded.
    pub fn target_partition(&self) -> Option<&Partition> {
        if self.recovery_upgrade {
            self.partitions.recovery.as_ref()
        } else {
            self.partitions.state.as_ref()
        }
    }

    pub fn target_image(&self) -> &Image {
        if self.recovery_upgrade {
            &self.recovery
        } else {
            &self.active
        }
    }

    pub fn sanitize(&mut self) -> Result<()> {
        if self.target_partition().is_none() {
            let which = if self.recovery_upgrade { "recovery" } else { "state" };
            return Err(err(
                ErrorKind::MissingPartition,
                format!("{which} partition not found"),
            ));
        }
        if self.target_image().source.is_empty() {
            return Err(err(ErrorKind::InvalidFlags, "undefined upgrade source"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitions::tests::LSBLK_JSON;
    use cairn_hal::FakeHal;
    use std::sync::Arc;

    fn lsblk_config(hal: &FakeHal) -> Config {
        hal.set_side_effect(|program, _| match program {
            "lsblk" => Ok(LSBLK_JSON.as_bytes().to_vec()),
            _ => Ok(Vec::new()),
        });
        Config::new(Arc::new(hal.clone())).unwrap()
    }

    #[test]
    fn install_defaults_derive_recovery_and_passive_from_active() {
        let hal = FakeHal::new();
        let cfg = Config::new(Arc::new(hal)).unwrap().with_firmware(Firmware::Efi);
        let mut spec = InstallSpec::new(&cfg, "/dev/sda");
        spec.active.source = ImageSource::Docker("registry.org/os:v1".to_string());
        spec.sanitize().unwrap();

        let active_file = ImageSource::File(spec.active.file.clone());
        assert_eq!(spec.recovery.source, active_file);
        assert_eq!(spec.passive.source, active_file);
        assert!(spec.partitions.efi.is_some());
        assert_eq!(spec.state_dir(), PathBuf::from(constants::STATE_DIR));
    }

    #[test]
    fn install_requires_a_source() {
        let cfg = Config::new(Arc::new(FakeHal::new())).unwrap();
        let mut spec = InstallSpec::new(&cfg, "/dev/sda");
        let e = spec.sanitize().unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::InvalidFlags));
    }

    #[test]
    fn install_rejects_efi_on_msdos() {
        let cfg = Config::new(Arc::new(FakeHal::new()))
            .unwrap()
            .with_firmware(Firmware::Efi);
        let mut spec = InstallSpec::new(&cfg, "/dev/sda");
        spec.active.source = ImageSource::Dir(PathBuf::from("/srv/root"));
        spec.part_table = constants::MSDOS.to_string();
        let e = spec.sanitize().unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::InvalidLayout));
    }

    #[test]
    fn install_rejects_second_zero_size_partition() {
        let cfg = Config::new(Arc::new(FakeHal::new())).unwrap();
        let mut spec = InstallSpec::new(&cfg, "/dev/sda");
        spec.active.source = ImageSource::Dir(PathBuf::from("/srv/root"));
        spec.extra_partitions
            .push(Partition::new("data", "DATA", 0, "xfs", None));
        let e = spec.sanitize().unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::InvalidLayout));
    }

    #[test]
    fn squashfs_recovery_changes_file_name() {
        let cfg = Config::new(Arc::new(FakeHal::new())).unwrap();
        let mut spec = InstallSpec::new(&cfg, "/dev/sda");
        spec.set_squashfs_recovery();
        assert!(spec.recovery.is_squashfs());
        assert!(spec.recovery.file.ends_with("cOS/recovery.squashfs"));
    }

    #[test]
    fn reset_outside_recovery_is_refused() {
        let hal = FakeHal::new();
        hal.set_cmdline("root=LABEL=COS_ACTIVE");
        let cfg = lsblk_config(&hal);
        let e = ResetSpec::new(&cfg).unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::ResetNotFromRecovery));
        assert!(hal.commands().is_empty());
    }

    #[test]
    fn reset_from_recovery_image_uses_running_state() {
        let hal = FakeHal::new();
        hal.set_cmdline("root=LABEL=COS_SYSTEM");
        let cfg = lsblk_config(&hal);
        let spec = ResetSpec::new(&cfg).unwrap();

        assert_eq!(spec.target, "/dev/sda");
        assert_eq!(
            spec.active.source,
            ImageSource::File(PathBuf::from("/run/initramfs/cos-state/cOS/recovery.img"))
        );
        assert_eq!(
            spec.active.file,
            PathBuf::from(constants::STATE_DIR).join("cOS/active.img")
        );
        // BIOS firmware: the ESP is not touched
        assert!(spec.partitions.efi.is_none());
    }

    #[test]
    fn reset_from_squashfs_uses_live_tree() {
        let hal = FakeHal::new();
        hal.set_cmdline("rd.live.squashimg=recovery.squashfs");
        let spec = ResetSpec::new(&lsblk_config(&hal)).unwrap();
        assert_eq!(
            spec.active.source,
            ImageSource::Dir(PathBuf::from(constants::ISO_BASE_TREE))
        );
    }

    #[test]
    fn upgrade_targets_state_or_recovery() {
        let hal = FakeHal::new();
        let mut spec = UpgradeSpec::new(&lsblk_config(&hal)).unwrap();
        assert!(spec.sanitize().is_err());

        spec.set_source(ImageSource::Docker("registry.org/os:v2".to_string()));
        spec.sanitize().unwrap();
        assert_eq!(spec.target_partition().unwrap().filesystem_label, "COS_STATE");

        spec.recovery_upgrade = true;
        assert_eq!(spec.target_partition().unwrap().filesystem_label, "COS_RECOVERY");
        assert_eq!(spec.target_image().label, constants::SYSTEM_LABEL);
    }
}
