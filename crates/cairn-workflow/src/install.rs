//! Fresh installation onto a block device.

use crate::common::{chroot_extra_mounts, efi_dir, power_action, write_install_state};
use anyhow::Result;
use cairn_core::cleanup::CleanStack;
use cairn_core::config::RunConfig;
use cairn_core::constants;
use cairn_core::deployer::Deployer;
use cairn_core::errors::{err, ErrorKind, KindContext};
use cairn_core::grub::{Grub, GrubTarget};
use cairn_core::hooks;
use cairn_core::install_state::{ImageState, InstallState, ACTIVE_IMAGE, PASSIVE_IMAGE, RECOVERY_IMAGE};
use cairn_core::partitioner::Disk;
use cairn_core::specs::InstallSpec;
use cairn_core::types::{Firmware, Image, ImageSource};
use std::path::PathBuf;
use std::time::Duration;

pub struct InstallAction<'a> {
    run: &'a RunConfig,
    spec: InstallSpec,
    part_tries: u32,
    part_backoff: Duration,
}

impl<'a> InstallAction<'a> {
    pub fn new(run: &'a RunConfig, spec: InstallSpec) -> Self {
        Self {
            run,
            spec,
            part_tries: 10,
            part_backoff: Duration::from_secs(1),
        }
    }

    /// How long to wait for new partition device nodes.
    pub fn with_partition_retry(mut self, tries: u32, backoff: Duration) -> Self {
        self.part_tries = tries;
        self.part_backoff = backoff;
        self
    }

    pub fn spec(&self) -> &InstallSpec {
        &self.spec
    }

    /// Install the system, then reboot or power off when requested.
    ///
    /// Every mount and loop device taken along the way is released before
    /// returning, also on failure.
    pub fn run(mut self) -> Result<()> {
        let run = self.run;
        let cfg = &run.config;
        self.spec.sanitize()?;

        hooks::hook(cfg, "before-install", cfg.strict)?;

        let deployer = Deployer::new(cfg);
        let mut cleanup = CleanStack::new();
        let result = self.install(&deployer, &mut cleanup);
        cleanup.cleanup(result)?;

        log::info!("Installation complete");
        power_action(run)
    }

    fn install<'d>(&mut self, deployer: &'d Deployer<'_>, cleanup: &mut CleanStack<'d>) -> Result<()> {
        let cfg = deployer.config();

        if self.spec.no_format {
            if deployer.check_active_deployment() && !self.spec.force {
                return Err(err(
                    ErrorKind::AlreadyInstalled,
                    "use --force to install over an existing deployment",
                ));
            }
        } else {
            self.partition_and_format()
                .kind(ErrorKind::PartitioningDevice)?;
        }

        let layout = self.spec.partitions.clone();
        deployer.mount_partitions(&layout)?;
        cleanup.push(move || deployer.unmount_partitions(&layout));

        let active_meta = deployer
            .deploy_image(&mut self.spec.active, true)
            .kind(ErrorKind::DeployImage)?;
        let mut mounted_active = self.spec.active.clone();
        cleanup.push(move || deployer.unmount_image(&mut mounted_active));

        if !self.spec.cloud_init.is_empty() {
            let oem_dir = self
                .spec
                .partitions
                .oem
                .as_ref()
                .and_then(|p| p.mount_point.clone())
                .unwrap_or_else(|| PathBuf::from(constants::OEM_DIR));
            deployer.copy_cloud_config(&oem_dir, &self.spec.cloud_init)?;
        }

        let state_dir = self.spec.state_dir();
        let esp = efi_dir(&self.spec.partitions, self.spec.firmware == Firmware::Efi);
        Grub::new(cfg).install(&GrubTarget {
            device: &self.spec.target,
            root_dir: &self.spec.active.mount_point,
            boot_dir: &state_dir,
            efi_dir: esp.as_deref(),
            tty: self.spec.tty.as_deref(),
        })?;

        deployer.selinux_relabel(&self.spec.active.mount_point, false)?;

        hooks::chroot_hook(
            cfg,
            "after-install-chroot",
            cfg.strict,
            &self.spec.active.mount_point,
            &chroot_extra_mounts(&*cfg.hal, &self.spec.partitions),
        )?;

        // A squashfs recovery is packed from the mounted active tree.
        let recovery_from_active = is_copy_of(&self.spec.recovery, &self.spec.active);
        let squash_from_active = recovery_from_active && self.spec.recovery.is_squashfs();
        let mut recovery_meta = None;
        if squash_from_active {
            self.spec.recovery.source = ImageSource::Dir(self.spec.active.mount_point.clone());
            recovery_meta = deployer
                .deploy_image(&mut self.spec.recovery, false)
                .kind(ErrorKind::DeployImage)?;
        }

        deployer.unmount_image(&mut self.spec.active)?;

        if !squash_from_active {
            recovery_meta = deployer
                .deploy_image(&mut self.spec.recovery, false)
                .kind(ErrorKind::DeployImage)?;
        }
        deployer
            .deploy_image(&mut self.spec.passive, false)
            .kind(ErrorKind::DeployImage)?;

        hooks::hook(cfg, "after-install", cfg.strict)?;

        Grub::new(cfg).set_default_entry(&state_dir, &self.spec.grub_default_entry)?;

        let mut state = self.install_state(active_meta, recovery_meta, recovery_from_active);
        let recovery_dir = self.spec.recovery_dir();
        write_install_state(&mut state, &[state_dir.as_path(), recovery_dir.as_path()])
    }

    /// Write a new partition table on the target and create every partition.
    ///
    /// Device paths of the new partitions are recorded in the [`InstallSpec`].
    fn partition_and_format(&mut self) -> Result<()> {
        let hal = &*self.run.config.hal;
        log::info!("Partitioning device {}", self.spec.target);
        let mut disk = Disk::new(&self.spec.target, hal).with_retry(self.part_tries, self.part_backoff);
        if !disk.exists() {
            return Err(err(
                ErrorKind::InvalidTarget,
                format!("{} does not exist", self.spec.target),
            ));
        }
        disk.new_partition_table(&self.spec.part_table)?;

        let ordered = self
            .spec
            .partitions
            .partitions_by_install_order(&self.spec.extra_partitions)?;
        for part in ordered {
            log::debug!("Adding partition {}", part.name);
            let number = disk.add_partition(part.size, &part.fs, &part.name, &part.flags)?;
            if part.fs.is_empty() {
                continue;
            }
            let device = disk
                .format_partition(number, &part.fs, &part.filesystem_label)
                .kind(ErrorKind::FormatPartitions)?;
            let slot = match self.spec.partitions.get_mut_by_name(&part.name) {
                Some(slot) => Some(slot),
                None => self
                    .spec
                    .extra_partitions
                    .iter_mut()
                    .find(|p| p.name == part.name),
            };
            if let Some(slot) = slot {
                slot.path = Some(PathBuf::from(device));
                slot.disk = Some(self.spec.target.clone());
            }
        }
        Ok(())
    }

    fn install_state(
        &self,
        active_meta: Option<String>,
        recovery_meta: Option<String>,
        recovery_from_active: bool,
    ) -> InstallState {
        let spec = &self.spec;
        let mut state = InstallState::new();
        for part in spec.partitions.to_list() {
            state.set_partition(&part.name, &part.filesystem_label);
        }

        let active = ImageState::from_image(&spec.active, active_meta);
        let passive = ImageState {
            label: spec.passive.label.clone(),
            ..active.clone()
        };
        let recovery = if recovery_from_active {
            ImageState {
                label: spec.recovery.label.clone(),
                fs: spec.recovery.fs.clone(),
                ..active.clone()
            }
        } else {
            ImageState::from_image(&spec.recovery, recovery_meta)
        };

        state.set_image(constants::STATE_PART_NAME, constants::STATE_LABEL, ACTIVE_IMAGE, active);
        state.set_image(constants::STATE_PART_NAME, constants::STATE_LABEL, PASSIVE_IMAGE, passive);
        state.set_image(
            constants::RECOVERY_PART_NAME,
            constants::RECOVERY_LABEL,
            RECOVERY_IMAGE,
            recovery,
        );
        state
    }
}

/// Whether `img` is deployed from the image file of `of`.
fn is_copy_of(img: &Image, of: &Image) -> bool {
    matches!(&img.source, ImageSource::File(f) if *f == of.file)
}
