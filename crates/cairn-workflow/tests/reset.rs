mod common;

use cairn_core::errors::{kind_of, ErrorKind};
use cairn_core::install_state::{load_state, ImageState, InstallState, ACTIVE_IMAGE, RECOVERY_IMAGE};
use cairn_core::specs::ResetSpec;
use cairn_core::types::ImageSource;
use cairn_hal::FakeHal;
use cairn_workflow::ResetAction;
use common::*;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

const RECOVERY_CMDLINE: &str = "BOOT_IMAGE=/cOS/recovery.img root=LABEL=COS_SYSTEM rd.cos.oemlabel=COS_OEM";

struct Setup {
    dir: TempDir,
    hal: FakeHal,
    stages: Arc<Stages>,
}

impl Setup {
    fn new(stages: Stages) -> Self {
        let hal = FakeHal::new();
        fake_lsblk(&hal, lsblk_json(&[]));
        hal.set_cmdline(RECOVERY_CMDLINE);
        Self {
            dir: tempdir().unwrap(),
            hal,
            stages: Arc::new(stages),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// A reset spec redeploying a recovery image file living in the scratch dir.
    fn spec(&self, run: &cairn_core::RunConfig) -> ResetSpec {
        let root = self.root();
        let mut spec = ResetSpec::new(&run.config).unwrap();
        rebase_layout(root, &mut spec.partitions);
        rebase_image(root, &mut spec.active);
        rebase_image(root, &mut spec.passive);
        // the images live on the rebased state partition
        let state_dir = spec.state_dir();
        spec.active.file = state_dir.join("cOS/active.img");
        spec.passive.file = state_dir.join("cOS/passive.img");

        let recovery_img = root.join("recovery.img");
        fs::write(&recovery_img, b"recovery system").unwrap();
        spec.active.source = ImageSource::File(recovery_img);
        seed_grub_cfg(&spec.active.mount_point);
        spec
    }
}

#[test]
fn reset_outside_recovery_changes_nothing() {
    let setup = Setup::new(Stages::default());
    let run = run_config(&setup.hal, setup.stages.clone(), false);
    let spec = setup.spec(&run);
    setup.hal.clear();
    setup.hal.set_cmdline("BOOT_IMAGE=/cOS/active.img root=LABEL=COS_ACTIVE");

    let e = ResetAction::new(&run, spec).run().unwrap_err();

    assert_eq!(kind_of(&e), Some(ErrorKind::ResetNotFromRecovery));
    assert_eq!(e.to_string(), "reset can only be called from the recovery system");
    assert!(setup.hal.operations().is_empty());
    assert!(setup.stages.names().is_empty());
}

#[test]
fn reset_spec_requires_recovery_boot() {
    let setup = Setup::new(Stages::default());
    setup.hal.set_cmdline("root=LABEL=COS_PASSIVE");
    let run = run_config(&setup.hal, setup.stages.clone(), false);

    let e = ResetSpec::new(&run.config).unwrap_err();

    assert_eq!(kind_of(&e), Some(ErrorKind::ResetNotFromRecovery));
    assert!(setup.hal.operations().is_empty());
}

#[test]
fn reset_formats_state_and_redeploys() {
    let setup = Setup::new(Stages::default());
    let run = run_config(&setup.hal, setup.stages.clone(), false);
    let spec = setup.spec(&run);
    let state_dir = spec.state_dir();
    let recovery_dir = spec.recovery_dir();
    let oem_dir = spec.partitions.oem.as_ref().unwrap().mount_point.clone().unwrap();
    setup.hal.add_mounted(oem_dir.clone());

    // state left behind by the install, only on the recovery partition
    let mut previous = InstallState::new();
    previous.set_image(
        "recovery",
        "COS_RECOVERY",
        RECOVERY_IMAGE,
        ImageState {
            source: "oci://registry.org/os:v1".to_string(),
            source_metadata: None,
            label: "COS_SYSTEM".to_string(),
            fs: "ext2".to_string(),
        },
    );
    previous.write_to(&[recovery_dir.as_path()]).unwrap();

    ResetAction::new(&run, spec).run().unwrap();

    assert_eq!(
        mkfs_labels(&setup.hal),
        vec![("/dev/sda4".to_string(), "COS_STATE".to_string())]
    );
    assert!(setup.hal.mounted_paths().is_empty());
    // oem was unmounted before anything got formatted
    let cmds = setup.hal.operations();
    let first_unmount = cmds
        .iter()
        .position(|op| matches!(op, cairn_hal::Operation::Unmount { target } if *target == oem_dir))
        .unwrap();
    let first_mkfs = cmds
        .iter()
        .position(|op| matches!(op, cairn_hal::Operation::Command { program, .. } if program == "mkfs.ext4"))
        .unwrap();
    assert!(first_unmount < first_mkfs);
    // recovery is never mounted by a reset
    assert!(!setup.hal.has_operation(|op| matches!(
        op,
        cairn_hal::Operation::Mount { target, .. } if *target == recovery_dir
    )));

    assert_eq!(
        fs::read(state_dir.join("cOS/active.img")).unwrap(),
        b"recovery system"
    );
    assert!(state_dir.join("cOS/passive.img").exists());
    setup
        .hal
        .commands()
        .iter()
        .find(|c| c[0] == "tune2fs" && c[2] == "COS_PASSIVE")
        .unwrap();

    let state = load_state(&state_dir.join("state.toml")).unwrap().unwrap();
    assert!(state.image("state", ACTIVE_IMAGE).unwrap().source.starts_with("file://"));
    assert_eq!(
        state.image("recovery", RECOVERY_IMAGE).unwrap().source,
        "oci://registry.org/os:v1"
    );

    let stages = setup.stages.names();
    assert_eq!(stages.first().map(String::as_str), Some("before-reset.before"));
    assert!(stages.contains(&"after-reset-chroot".to_string()));
    assert!(stages.contains(&"after-reset".to_string()));
}

#[test]
fn reset_persistent_also_formats_persistent_and_oem() {
    let setup = Setup::new(Stages::default());
    let run = run_config(&setup.hal, setup.stages.clone(), false);
    let mut spec = setup.spec(&run);
    spec.format_persistent = true;
    spec.format_oem = true;

    ResetAction::new(&run, spec).run().unwrap();

    let labels: Vec<String> = mkfs_labels(&setup.hal).into_iter().map(|(_, l)| l).collect();
    assert_eq!(labels, vec!["COS_STATE", "COS_PERSISTENT", "COS_OEM"]);
}

#[test]
fn failing_deploy_unmounts_partitions() {
    let setup = Setup::new(Stages::default());
    let run = run_config(&setup.hal, setup.stages.clone(), false);
    let mut spec = setup.spec(&run);
    spec.active.source = ImageSource::File(setup.root().join("missing.img"));

    let e = ResetAction::new(&run, spec).run().unwrap_err();

    assert_eq!(kind_of(&e), Some(ErrorKind::DeployImage));
    assert!(setup.hal.mounted_paths().is_empty());
}
