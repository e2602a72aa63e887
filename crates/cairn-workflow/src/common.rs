//! Pieces shared by the lifecycle actions.

use anyhow::Result;
use cairn_core::config::RunConfig;
use cairn_core::constants;
use cairn_core::errors::{ErrorKind, KindContext};
use cairn_core::install_state::InstallState;
use cairn_core::types::PartitionLayout;
use cairn_hal::SystemHal;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;

/// Reboot or power off the host if requested by `run`.
pub fn power_action(run: &RunConfig) -> Result<()> {
    let (program, kind) = match (run.reboot, run.poweroff) {
        (true, _) => ("reboot", ErrorKind::Reboot),
        (false, true) => ("poweroff", ErrorKind::PowerOff),
        (false, false) => return Ok(()),
    };
    log::info!("Running {} in {:?}", program, run.power_delay);
    thread::sleep(run.power_delay);
    run.config.hal.run(program, &["-f"]).kind(kind)?;
    Ok(())
}

/// Bind mounts exposing the persistent and OEM partitions to chroot hooks.
///
/// Only partitions currently mounted on their mount point are exposed.
pub fn chroot_extra_mounts(hal: &dyn SystemHal, layout: &PartitionLayout) -> BTreeMap<PathBuf, PathBuf> {
    let mut mounts = BTreeMap::new();
    for (part, target) in [(&layout.persistent, "/usr/local"), (&layout.oem, "/oem")] {
        let Some(mp) = part.as_ref().and_then(|p| p.mount_point.clone()) else {
            continue;
        };
        match hal.is_mounted(&mp) {
            Ok(true) => {
                mounts.insert(mp, PathBuf::from(target));
            }
            Ok(false) => log::debug!("{} is not mounted, not exposing it to hooks", mp.display()),
            Err(e) => log::warn!("could not check mount state of {}: {}", mp.display(), e),
        }
    }
    mounts
}

/// Mount point of the EFI system partition when grub is installed for EFI.
pub fn efi_dir(layout: &PartitionLayout, efi: bool) -> Option<PathBuf> {
    if !efi {
        return None;
    }
    Some(
        layout
            .efi
            .as_ref()
            .and_then(|p| p.mount_point.clone())
            .unwrap_or_else(|| PathBuf::from(constants::EFI_DIR)),
    )
}

/// Write `state` into every directory of `dirs` that exists.
pub fn write_install_state(state: &mut InstallState, dirs: &[&Path]) -> Result<()> {
    let present: Vec<&Path> = dirs.iter().copied().filter(|d| d.is_dir()).collect();
    state.write_to(&present)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::config::Config;
    use cairn_hal::FakeHal;
    use std::sync::Arc;
    use std::time::Duration;

    fn run_config(hal: &FakeHal) -> RunConfig {
        let mut run = RunConfig::new(Config::new(Arc::new(hal.clone())).unwrap());
        run.power_delay = Duration::ZERO;
        run
    }

    #[test]
    fn reboot_is_forced() {
        let hal = FakeHal::new();
        let mut run = run_config(&hal);
        run.reboot = true;
        power_action(&run).unwrap();
        hal.cmds_match(&[&["reboot", "-f"]]).unwrap();
    }

    #[test]
    fn poweroff_when_requested() {
        let hal = FakeHal::new();
        let mut run = run_config(&hal);
        run.poweroff = true;
        power_action(&run).unwrap();
        hal.cmds_match(&[&["poweroff", "-f"]]).unwrap();
    }

    #[test]
    fn nothing_runs_by_default() {
        let hal = FakeHal::new();
        power_action(&run_config(&hal)).unwrap();
        assert!(hal.commands().is_empty());
    }

    #[test]
    fn extra_mounts_follow_layout() {
        let hal = FakeHal::new();
        hal.add_mounted("/run/cos/persistent");
        hal.add_mounted("/run/cos/oem");
        let layout = PartitionLayout::with_defaults();
        let mounts = chroot_extra_mounts(&hal, &layout);
        assert_eq!(
            mounts.get(Path::new("/run/cos/persistent")),
            Some(&PathBuf::from("/usr/local"))
        );
        assert_eq!(mounts.get(Path::new("/run/cos/oem")), Some(&PathBuf::from("/oem")));
        assert!(chroot_extra_mounts(&hal, &PartitionLayout::default()).is_empty());
    }

    #[test]
    fn efi_dir_uses_layout_mount_point() {
        let mut layout = PartitionLayout::with_defaults();
        assert_eq!(efi_dir(&layout, false), None);
        layout.set_firmware_partitions(cairn_core::types::Firmware::Efi, "gpt").unwrap();
        layout.efi.as_mut().unwrap().mount_point = Some(PathBuf::from("/boot/efi"));
        assert_eq!(efi_dir(&layout, true), Some(PathBuf::from("/boot/efi")));
        assert_eq!(
            efi_dir(&PartitionLayout::default(), true),
            Some(PathBuf::from(constants::EFI_DIR))
        );
    }

    #[test]
    fn unmounted_partitions_are_not_exposed() {
        let hal = FakeHal::new();
        hal.add_mounted("/run/cos/oem");
        let mounts = chroot_extra_mounts(&hal, &PartitionLayout::with_defaults());
        assert_eq!(mounts.len(), 1);
        assert!(!mounts.contains_key(Path::new("/run/cos/persistent")));
    }
}
