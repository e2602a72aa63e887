//! Reset of an installed system back to its recovery image.

use crate::common::{chroot_extra_mounts, efi_dir, power_action, write_install_state};
use anyhow::Result;
use cairn_core::cleanup::CleanStack;
use cairn_core::config::RunConfig;
use cairn_core::constants;
use cairn_core::deployer::Deployer;
use cairn_core::errors::{ErrorKind, KindContext};
use cairn_core::grub::{Grub, GrubTarget};
use cairn_core::hooks;
use cairn_core::install_state::{ImageState, InstallState, ACTIVE_IMAGE, PASSIVE_IMAGE};
use cairn_core::specs::{ensure_recovery_boot, ResetSpec};
use cairn_core::types::PartitionLayout;

pub struct ResetAction<'a> {
    run: &'a RunConfig,
    spec: ResetSpec,
}

impl<'a> ResetAction<'a> {
    pub fn new(run: &'a RunConfig, spec: ResetSpec) -> Self {
        Self { run, spec }
    }

    pub fn spec(&self) -> &ResetSpec {
        &self.spec
    }

    /// Redeploy active and passive from the recovery system.
    ///
    /// Refuses to touch anything unless the host runs the recovery system.
    pub fn run(mut self) -> Result<()> {
        let run = self.run;
        let cfg = &run.config;
        ensure_recovery_boot(cfg)?;
        self.spec.sanitize()?;

        hooks::hook(cfg, "before-reset", cfg.strict)?;

        let deployer = Deployer::new(cfg);
        let mut cleanup = CleanStack::new();
        let result = self.reset(&deployer, &mut cleanup);
        cleanup.cleanup(result)?;

        log::info!("Reset complete");
        power_action(run)
    }

    /// The layout handled by a reset: everything but Recovery.
    fn reset_layout(&self) -> PartitionLayout {
        PartitionLayout {
            recovery: None,
            ..self.spec.partitions.clone()
        }
    }

    fn reset<'d>(&mut self, deployer: &'d Deployer<'_>, cleanup: &mut CleanStack<'d>) -> Result<()> {
        let cfg = deployer.config();
        let state_dir = self.spec.state_dir();
        let recovery_dir = self.spec.recovery_dir();
        let previous = InstallState::load_from(&[state_dir.as_path(), recovery_dir.as_path()])
            .unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable install state: {:#}", e);
                None
            });

        let layout = self.reset_layout();
        deployer.unmount_partitions(&layout)?;
        self.format_partitions(deployer)
            .kind(ErrorKind::FormatPartitions)?;

        deployer.mount_partitions(&layout)?;
        cleanup.push(move || deployer.unmount_partitions(&layout));

        let active_meta = deployer
            .deploy_image(&mut self.spec.active, true)
            .kind(ErrorKind::DeployImage)?;
        let mut mounted_active = self.spec.active.clone();
        cleanup.push(move || deployer.unmount_image(&mut mounted_active));

        let esp = efi_dir(&self.spec.partitions, self.spec.efi);
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
            "after-reset-chroot",
            cfg.strict,
            &self.spec.active.mount_point,
            &chroot_extra_mounts(&*cfg.hal, &self.spec.partitions),
        )?;

        deployer.unmount_image(&mut self.spec.active)?;

        deployer
            .deploy_image(&mut self.spec.passive, false)
            .kind(ErrorKind::DeployImage)?;

        hooks::hook(cfg, "after-reset", cfg.strict)?;

        Grub::new(cfg).set_default_entry(&state_dir, &self.spec.grub_default_entry)?;

        let mut state = previous.unwrap_or_default();
        let active = ImageState::from_image(&self.spec.active, active_meta);
        let passive = ImageState {
            label: self.spec.passive.label.clone(),
            ..active.clone()
        };
        state.set_image(constants::STATE_PART_NAME, constants::STATE_LABEL, ACTIVE_IMAGE, active);
        state.set_image(constants::STATE_PART_NAME, constants::STATE_LABEL, PASSIVE_IMAGE, passive);
        for part in self.spec.partitions.to_list() {
            state.set_partition(&part.name, &part.filesystem_label);
        }
        write_install_state(&mut state, &[state_dir.as_path()])
    }

    fn format_partitions(&self, deployer: &Deployer<'_>) -> Result<()> {
        let layout = &self.spec.partitions;
        if let Some(state) = &layout.state {
            deployer.format_partition(state, &[])?;
        }
        if self.spec.format_persistent {
            if let Some(persistent) = &layout.persistent {
                deployer.format_partition(persistent, &[])?;
            }
        }
        if self.spec.format_oem {
            if let Some(oem) = &layout.oem {
                deployer.format_partition(oem, &[])?;
            }
        }
        Ok(())
    }
}
