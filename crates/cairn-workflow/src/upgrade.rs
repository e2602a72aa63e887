//! In-place upgrade of the active or recovery image.
//!
//! The new system is always built in a transition image next to the live
//! one. The live image is only replaced once deployment and all hooks have
//! succeeded; a failed upgrade leaves it untouched and removes the
//! transition image again.

use crate::common::{chroot_extra_mounts, power_action};
use anyhow::{Context, Result};
use cairn_core::cleanup::CleanStack;
use cairn_core::config::RunConfig;
use cairn_core::constants;
use cairn_core::deployer::Deployer;
use cairn_core::errors::{err, ErrorKind, KindContext};
use cairn_core::hooks;
use cairn_core::install_state::{ImageState, InstallState, ACTIVE_IMAGE, PASSIVE_IMAGE, RECOVERY_IMAGE};
use cairn_core::partitions::{self, BootState};
use cairn_core::specs::UpgradeSpec;
use cairn_core::types::{Image, Partition};
use cairn_hal::MountOptions;
use std::fs;
use std::path::{Path, PathBuf};

pub struct UpgradeAction<'a> {
    run: &'a RunConfig,
    spec: UpgradeSpec,
}

impl<'a> UpgradeAction<'a> {
    pub fn new(run: &'a RunConfig, spec: UpgradeSpec) -> Self {
        Self { run, spec }
    }

    pub fn spec(&self) -> &UpgradeSpec {
        &self.spec
    }

    pub fn run(mut self) -> Result<()> {
        let run = self.run;
        let cfg = &run.config;
        self.spec.sanitize()?;

        let deployer = Deployer::new(cfg);
        let mut cleanup = CleanStack::new();
        let result = self.upgrade(&deployer, &mut cleanup);
        cleanup.cleanup(result)?;

        log::info!("Upgrade completed");
        power_action(run)
    }

    fn upgrade<'d>(&mut self, deployer: &'d Deployer<'_>, cleanup: &mut CleanStack<'d>) -> Result<()> {
        let cfg = deployer.config();
        let recovery_upgrade = self.spec.recovery_upgrade;
        let part = self
            .spec
            .target_partition()
            .cloned()
            .ok_or_else(|| err(ErrorKind::MissingPartition, "no partition to upgrade"))?;
        let mount_kind = if recovery_upgrade {
            ErrorKind::MountRecoveryPartition
        } else {
            ErrorKind::MountStatePartition
        };
        self.mount_target(deployer, cleanup, &part).kind(mount_kind)?;
        if !recovery_upgrade && partitions::boot_state(&*cfg.hal) == BootState::Recovery {
            // the recovery system leaves OEM and Persistent unmounted
            self.mount_data_partitions(deployer, cleanup);
        }

        let live = self.spec.target_image().file.clone();
        let mut transition = transition_image(self.spec.target_image());
        let transition_file = transition.file.clone();
        cleanup.push(move || remove_if_exists(&transition_file));

        hooks::hook(cfg, "before-upgrade", cfg.strict)?;

        let squashfs = transition.is_squashfs();
        let meta = deployer
            .deploy_image(&mut transition, !squashfs)
            .kind(ErrorKind::DeployImage)?;
        if squashfs {
            deployer.mount_image(&mut transition, &["ro"])?;
        }
        let mut mounted = transition.clone();
        cleanup.push(move || deployer.unmount_image(&mut mounted));

        hooks::chroot_hook(
            cfg,
            "after-upgrade-chroot",
            cfg.strict,
            &transition.mount_point,
            &chroot_extra_mounts(&*cfg.hal, &self.spec.partitions),
        )?;
        if !squashfs {
            deployer.selinux_relabel(&transition.mount_point, false)?;
        }
        hooks::hook(cfg, "after-upgrade", cfg.strict)?;

        deployer.unmount_image(&mut transition)?;

        let hal = &*cfg.hal;
        if !recovery_upgrade && live.exists() {
            let passive = live.with_file_name(constants::PASSIVE_IMG_FILE);
            log::info!("Moving {} to {}", live.display(), passive.display());
            let (from, to) = (live.to_string_lossy(), passive.to_string_lossy());
            hal.run("mv", &["-f", from.as_ref(), to.as_ref()])
                .kind(ErrorKind::MoveFile)?;
            hal.run("tune2fs", &["-L", constants::PASSIVE_LABEL, to.as_ref()])
                .kind(ErrorKind::LabelImage)?;
        }

        log::info!("Moving {} to {}", transition.file.display(), live.display());
        let (from, to) = (transition.file.to_string_lossy(), live.to_string_lossy());
        hal.run("mv", &["-f", from.as_ref(), to.as_ref()])
            .kind(ErrorKind::MoveFile)?;
        hal.run("sync", &[]).kind(ErrorKind::CommandRun)?;

        self.update_install_state(&transition, meta)
    }

    /// Make the target partition writable, restoring its previous state on cleanup.
    fn mount_target<'d>(
        &self,
        deployer: &'d Deployer<'_>,
        cleanup: &mut CleanStack<'d>,
        part: &Partition,
    ) -> Result<()> {
        let hal = &*deployer.config().hal;
        let mount_point = part
            .mount_point
            .clone()
            .ok_or_else(|| err(ErrorKind::MissingPartition, format!("{} has no mount point", part.name)))?;

        if hal.is_mounted(&mount_point)? {
            log::debug!("Remounting {} read-write", mount_point.display());
            let device = part.path.clone().unwrap_or_default();
            hal.mount_device(&device, &mount_point, None, &MountOptions::from_list(&["remount", "rw"]))
                .with_context(|| format!("failed to remount {}", mount_point.display()))?;
            cleanup.push(move || {
                deployer
                    .config()
                    .hal
                    .mount_device(&device, &mount_point, None, &MountOptions::from_list(&["remount", "ro"]))
                    .with_context(|| format!("failed to remount {}", mount_point.display()))
            });
        } else {
            deployer.mount_partition(part, &["rw"])?;
            let part = part.clone();
            cleanup.push(move || deployer.unmount_partition(&part));
        }
        Ok(())
    }

    /// Mount OEM and Persistent where they are not mounted yet.
    ///
    /// A partition that fails to mount is skipped with a warning.
    fn mount_data_partitions<'d>(&self, deployer: &'d Deployer<'_>, cleanup: &mut CleanStack<'d>) {
        let hal = &*deployer.config().hal;
        let layout = &self.spec.partitions;
        for part in [&layout.oem, &layout.persistent].into_iter().flatten() {
            let Some(mount_point) = &part.mount_point else {
                continue;
            };
            if hal.is_mounted(mount_point).unwrap_or(false) {
                continue;
            }
            match deployer.mount_partition(part, &[]) {
                Ok(()) => {
                    let part = part.clone();
                    cleanup.push(move || deployer.unmount_partition(&part));
                }
                Err(e) => log::warn!("Could not mount {} partition: {:#}", part.name, e),
            }
        }
    }

    fn update_install_state(&self, transition: &Image, meta: Option<String>) -> Result<()> {
        let hal = &*self.run.config.hal;
        let dirs: Vec<PathBuf> = [&self.spec.partitions.state, &self.spec.partitions.recovery]
            .into_iter()
            .flatten()
            .filter_map(|p| p.mount_point.clone())
            .filter(|mp| hal.is_mounted(mp).unwrap_or(false))
            .collect();
        let dir_refs: Vec<&Path> = dirs.iter().map(PathBuf::as_path).collect();

        let mut state = InstallState::load_from(&dir_refs)
            .unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable install state: {:#}", e);
                None
            })
            .unwrap_or_else(InstallState::new);

        let upgraded = ImageState::from_image(transition, meta);
        if self.spec.recovery_upgrade {
            state.set_image(
                constants::RECOVERY_PART_NAME,
                constants::RECOVERY_LABEL,
                RECOVERY_IMAGE,
                upgraded,
            );
        } else {
            if let Some(previous) = state.image(constants::STATE_PART_NAME, ACTIVE_IMAGE).cloned() {
                let passive = ImageState {
                    label: constants::PASSIVE_LABEL.to_string(),
                    ..previous
                };
                state.set_image(constants::STATE_PART_NAME, constants::STATE_LABEL, PASSIVE_IMAGE, passive);
            }
            state.set_image(constants::STATE_PART_NAME, constants::STATE_LABEL, ACTIVE_IMAGE, upgraded);
        }
        state.write_to(&dir_refs)
    }
}

/// The image being built: `img` with its file renamed to the transition file.
fn transition_image(img: &Image) -> Image {
    let name = if img.is_squashfs() {
        constants::TRANSITION_SQUASH_FILE
    } else {
        constants::TRANSITION_IMG_FILE
    };
    Image {
        file: img.file.with_file_name(name),
        loop_device: None,
        ..img.clone()
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        log::debug!("Removing {}", path.display());
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}
