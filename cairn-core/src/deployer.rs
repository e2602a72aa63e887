//! Mounting, formatting and image deployment primitives.

use crate::chroot::Chroot;
use crate::config::Config;
use crate::constants;
use crate::errors::{err, ErrorKind, KindContext, Result};
use crate::partitioner::format_device;
use crate::partitions;
use crate::types::{Image, ImageSource, Partition, PartitionLayout};
use anyhow::Context;
use cairn_hal::{CopyOptions, LoopGuard, MountOptions, SystemHal};
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Lifecycle building blocks bound to one [`Config`].
pub struct Deployer<'c> {
    cfg: &'c Config,
    label_tries: u32,
    label_backoff: Duration,
}

impl<'c> Deployer<'c> {
    pub fn new(cfg: &'c Config) -> Self {
        Self {
            cfg,
            label_tries: 10,
            label_backoff: Duration::from_secs(1),
        }
    }

    /// Retry settings of the label lookup done when mounting a partition without path.
    pub fn with_label_retry(mut self, tries: u32, backoff: Duration) -> Self {
        self.label_tries = tries;
        self.label_backoff = backoff;
        self
    }

    pub fn config(&self) -> &Config {
        self.cfg
    }

    fn hal(&self) -> &dyn SystemHal {
        &*self.cfg.hal
    }

    pub fn format_partition(&self, part: &Partition, opts: &[String]) -> Result<()> {
        let path = part.path.as_ref().ok_or_else(|| {
            err(
                ErrorKind::MissingPartition,
                format!("partition {} has no device", part.name),
            )
        })?;
        log::info!("Formatting '{}' partition", part.name);
        format_device(
            self.hal(),
            &path.to_string_lossy(),
            &part.fs,
            &part.filesystem_label,
            opts,
        )?;
        Ok(())
    }

    /// Mount `part` on its mount point, looking its device up by label when unknown.
    pub fn mount_partition(&self, part: &Partition, opts: &[&str]) -> Result<()> {
        let mount_point = part.mount_point.as_ref().ok_or_else(|| {
            err(
                ErrorKind::MountPartitions,
                format!("partition {} has no mount point", part.name),
            )
        })?;
        let device = match &part.path {
            Some(path) => path.clone(),
            None => partitions::find_partition_by_label(
                self.hal(),
                &part.filesystem_label,
                self.label_tries,
                self.label_backoff,
            )?
            .path
            .ok_or_else(|| {
                err(
                    ErrorKind::MissingPartition,
                    format!("no device for label {}", part.filesystem_label),
                )
            })?,
        };
        log::info!("Mounting {} on {}", device.display(), mount_point.display());
        fs::create_dir_all(mount_point)
            .with_context(|| format!("failed to create {}", mount_point.display()))
            .kind(ErrorKind::CreateDir)?;
        let fstype = (!part.fs.is_empty()).then_some(part.fs.as_str());
        self.hal()
            .mount_device(&device, mount_point, fstype, &MountOptions::from_list(opts))
            .with_context(|| format!("failed to mount {}", mount_point.display()))?;
        Ok(())
    }

    /// Unmount `part`; does nothing when it is not mounted.
    pub fn unmount_partition(&self, part: &Partition) -> Result<()> {
        let Some(mount_point) = &part.mount_point else {
            return Ok(());
        };
        if !self.hal().is_mounted(mount_point)? {
            log::debug!("Not unmounting partition, {} doesn't look like mountpoint", mount_point.display());
            return Ok(());
        }
        log::info!("Unmounting {} partition", part.name);
        self.hal()
            .unmount(mount_point)
            .with_context(|| format!("failed to unmount {}", mount_point.display()))?;
        Ok(())
    }

    /// Mount every partition of `layout` that has a mount point, shallowest first.
    ///
    /// On failure the partitions mounted so far are unmounted again.
    pub fn mount_partitions(&self, layout: &PartitionLayout) -> Result<()> {
        log::info!("Mounting disk partitions");
        let mut mounted: Vec<Partition> = Vec::new();
        for part in layout.ordered_by_mount_point(false) {
            if let Err(e) = self.mount_partition(&part, &["rw"]) {
                for done in mounted.iter().rev() {
                    if let Err(undo) = self.unmount_partition(done) {
                        log::warn!("failed to unmount {}: {:#}", done.name, undo);
                    }
                }
                return Err(e).kind(ErrorKind::MountPartitions);
            }
            mounted.push(part);
        }
        Ok(())
    }

    /// Unmount every partition of `layout`, deepest first. All are attempted.
    pub fn unmount_partitions(&self, layout: &PartitionLayout) -> Result<()> {
        log::info!("Unmounting disk partitions");
        let mut first_err = None;
        for part in layout.ordered_by_mount_point(true) {
            if let Err(e) = self.unmount_partition(&part) {
                log::warn!("{:#}", e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e).kind(ErrorKind::UnmountPartitions),
            None => Ok(()),
        }
    }

    /// Attach `img` to a loop device and mount it; the loop device is released on failure.
    pub fn mount_image(&self, img: &mut Image, opts: &[&str]) -> Result<()> {
        log::info!("Mounting image {}", img.label);
        fs::create_dir_all(&img.mount_point)
            .with_context(|| format!("failed to create {}", img.mount_point.display()))
            .kind(ErrorKind::CreateDir)?;
        let loop_dev = self
            .hal()
            .losetup_attach(&img.file)
            .with_context(|| format!("failed to attach {}", img.file.display()))?;
        let guard = LoopGuard::new(self.hal(), loop_dev);
        self.hal()
            .mount_device(
                Path::new(guard.device()),
                &img.mount_point,
                Some(img.fs.as_str()),
                &MountOptions::from_list(opts),
            )
            .with_context(|| format!("failed to mount {}", img.file.display()))?;
        img.loop_device = Some(guard.release());
        Ok(())
    }

    /// Unmount `img` and release its loop device; does nothing when it is not mounted.
    pub fn unmount_image(&self, img: &mut Image) -> Result<()> {
        if !self.hal().is_mounted(&img.mount_point)? {
            log::debug!("Not unmounting image, {} doesn't look like mountpoint", img.mount_point.display());
            return Ok(());
        }
        log::info!("Unmounting image {}", img.label);
        self.hal()
            .unmount(&img.mount_point)
            .with_context(|| format!("failed to unmount {}", img.mount_point.display()))
            .kind(ErrorKind::UnmountImage)?;
        if let Some(dev) = img.loop_device.take() {
            self.hal()
                .losetup_detach(&dev)
                .with_context(|| format!("failed to detach {dev}"))
                .kind(ErrorKind::UnmountImage)?;
        }
        Ok(())
    }

    /// Create the sparse image file of `img` and format it.
    pub fn create_filesystem_image(&self, img: &Image) -> Result<()> {
        log::info!("Creating file system image {}", img.file.display());
        if let Some(parent) = img.file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))
                .kind(ErrorKind::CreateDir)?;
        }
        let file = File::create(&img.file)
            .with_context(|| format!("failed to create {}", img.file.display()))
            .kind(ErrorKind::CreateFile)?;
        file.set_len(img.size * MIB)
            .with_context(|| format!("failed to truncate {}", img.file.display()))
            .kind(ErrorKind::TruncateFile)?;
        drop(file);
        format_device(
            self.hal(),
            &img.file.to_string_lossy(),
            &img.fs,
            &img.label,
            &[],
        )?;
        Ok(())
    }

    /// Materialize the source of `img` into its image file.
    ///
    /// Returns the source metadata reported by the unpacker, if any.
    pub fn deploy_image(&self, img: &mut Image, leave_mounted: bool) -> Result<Option<String>> {
        log::info!("Deploying image: {}", img.file.display());
        if let ImageSource::File(src) = &img.source {
            let src = src.clone();
            self.copy_image_file(&src, img)?;
            if leave_mounted {
                let mode = self.mount_mode(img);
                self.mount_image(img, &[mode])?;
            }
            return Ok(None);
        }

        if img.is_squashfs() {
            return self.deploy_squashfs(img);
        }

        self.create_filesystem_image(img)?;
        self.mount_image(img, &["rw"])?;
        let dumped = self
            .dump_source(&img.mount_point, &img.source)
            .and_then(|meta| {
                create_dirs_structure(&img.mount_point)?;
                Ok(meta)
            });
        let meta = match dumped {
            Ok(meta) => meta,
            Err(e) => {
                if let Err(undo) = self.unmount_image(img) {
                    log::warn!("failed to unmount {}: {:#}", img.file.display(), undo);
                }
                return Err(e);
            }
        };
        if !leave_mounted {
            self.unmount_image(img)?;
        }
        Ok(meta)
    }

    fn mount_mode(&self, img: &Image) -> &'static str {
        if img.is_squashfs() {
            "ro"
        } else {
            "rw"
        }
    }

    fn copy_image_file(&self, src: &Path, img: &Image) -> Result<()> {
        if let Some(parent) = img.file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))
                .kind(ErrorKind::CreateDir)?;
        }
        log::info!("Copying {} to {}", src.display(), img.file.display());
        fs::copy(src, &img.file)
            .with_context(|| {
                format!("failed to copy {} to {}", src.display(), img.file.display())
            })
            .kind(ErrorKind::CopyFile)?;
        if !img.label.is_empty() && !img.is_squashfs() {
            let file = img.file.to_string_lossy();
            self.hal()
                .run("tune2fs", &["-L", img.label.as_str(), file.as_ref()])
                .kind(ErrorKind::LabelImage)?;
        }
        Ok(())
    }

    fn deploy_squashfs(&self, img: &Image) -> Result<Option<String>> {
        let tmp = tempfile::Builder::new()
            .prefix("cairn-squash-")
            .tempdir()
            .context("failed to create temporary directory")
            .kind(ErrorKind::CreateDir)?;
        let meta = self.dump_source(tmp.path(), &img.source)?;
        create_dirs_structure(tmp.path())?;
        if let Some(parent) = img.file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))
                .kind(ErrorKind::CreateDir)?;
        }
        self.create_squashfs(tmp.path(), &img.file)?;
        Ok(meta)
    }

    /// Pack the tree at `root` into the squashfs image `dest`.
    pub fn create_squashfs(&self, root: &Path, dest: &Path) -> Result<()> {
        log::info!("Creating squashfs image {}", dest.display());
        let root = root.to_string_lossy();
        let dest_str = dest.to_string_lossy();
        let opts = constants::squashfs_options(&self.cfg.arch);
        let mut args: Vec<&str> = vec![root.as_ref(), dest_str.as_ref()];
        args.extend(opts.iter().map(String::as_str));
        self.hal().run("mksquashfs", &args).kind(ErrorKind::CommandRun)?;
        Ok(())
    }

    /// Copy or unpack `source` into the `target` directory.
    pub fn dump_source(&self, target: &Path, source: &ImageSource) -> Result<Option<String>> {
        log::info!("Copying {} source...", source);
        let meta = match source {
            ImageSource::Empty => None,
            ImageSource::Dir(dir) => {
                self.hal()
                    .copy_tree(dir, target, &CopyOptions::system_tree())
                    .with_context(|| format!("failed to copy {}", dir.display()))
                    .kind(ErrorKind::DumpSource)?;
                None
            }
            ImageSource::File(file) => {
                let dest = match file.file_name() {
                    Some(name) if target.is_dir() => target.join(name),
                    _ => target.to_path_buf(),
                };
                fs::copy(file, &dest)
                    .with_context(|| format!("failed to copy {}", file.display()))
                    .kind(ErrorKind::DumpSource)?;
                None
            }
            ImageSource::Docker(reference) => self
                .cfg
                .unpacker
                .unpack(target, reference, self.cfg.local_images)
                .kind(ErrorKind::DumpSource)?,
            ImageSource::Channel(reference) => self
                .cfg
                .unpacker
                .unpack_channel(target, reference)
                .kind(ErrorKind::DumpSource)?,
        };
        log::info!("Finished copying {} into {}", source, target.display());
        Ok(meta)
    }

    /// Fetch the user cloud-init files into `oem_dir` as `99_custom_<n>.yaml`.
    pub fn copy_cloud_config(&self, oem_dir: &Path, files: &[String]) -> Result<()> {
        for (idx, url) in files.iter().enumerate() {
            let dest = oem_dir.join(format!("99_custom_{idx}.yaml"));
            log::info!("Copying cloud config file {} to {}", url, dest.display());
            self.cfg.fetcher.get(url, &dest).kind(ErrorKind::DownloadFile)?;
            fs::set_permissions(&dest, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions of {}", dest.display()))
                .kind(ErrorKind::DownloadFile)?;
        }
        Ok(())
    }

    /// Relabel the tree at `root` with its own targeted SELinux policy.
    ///
    /// Skipped when the tree has no file contexts. Failures are only
    /// returned when `raise_error` is set.
    pub fn selinux_relabel(&self, root: &Path, raise_error: bool) -> Result<()> {
        let contexts = constants::SELINUX_TARGETED_CONTEXT_FILE;
        if !root.join(contexts.trim_start_matches('/')).exists() {
            log::debug!("No SELinux file contexts in {}, skipping relabel", root.display());
            return Ok(());
        }
        let Some(policy) = find_policy(root) else {
            log::debug!("No SELinux policy in {}, skipping relabel", root.display());
            return Ok(());
        };
        let policy = policy.to_string_lossy().to_string();

        let mut chroot = Chroot::new(root, self.hal());
        let res = chroot.run(
            "setfiles",
            &["-c", policy.as_str(), "-e", "/dev", "-e", "/proc", "-e", "/sys", "-F", contexts, "/"],
        );
        match res {
            Ok(_) => Ok(()),
            Err(e) if raise_error => Err(e).kind(ErrorKind::SelinuxRelabel),
            Err(e) => {
                log::warn!("SELinux relabel failed: {:#}", e);
                Ok(())
            }
        }
    }

    /// Whether a deployed system is present on this host.
    pub fn check_active_deployment(&self) -> bool {
        [constants::ACTIVE_LABEL, constants::PASSIVE_LABEL]
            .into_iter()
            .any(|label| match self.hal().run_string("blkid", &["-L", label]) {
                Ok(out) => !out.trim().is_empty(),
                Err(_) => false,
            })
    }
}

/// Path, relative to the chroot, of the newest policy file in `root`.
fn find_policy(root: &Path) -> Option<PathBuf> {
    let dir = root.join(constants::SELINUX_TARGETED_POLICY_DIR.trim_start_matches('/'));
    let mut names: Vec<String> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("policy."))
        .collect();
    names.sort();
    names
        .pop()
        .map(|n| Path::new(constants::SELINUX_TARGETED_POLICY_DIR).join(n))
}

/// Create the standard root directories in `root`.
pub fn create_dirs_structure(root: &Path) -> Result<()> {
    for dir in constants::ROOT_SKELETON {
        let path = root.join(dir);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create {}", path.display()))
            .kind(ErrorKind::CreateDir)?;
    }
    let tmp = root.join("tmp");
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777))
        .with_context(|| format!("failed to set permissions of {}", tmp.display()))
        .kind(ErrorKind::CreateDir)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::partitions::tests::LSBLK_JSON;
    use crate::unpack::Unpacker;
    use cairn_hal::{FakeHal, HalError, Operation};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    /// Unpacker writing a marker file and reporting a fixed digest.
    #[derive(Default)]
    pub(crate) struct MarkerUnpacker {
        pub calls: Mutex<Vec<(PathBuf, String, bool)>>,
        pub fail: bool,
    }

    impl Unpacker for MarkerUnpacker {
        fn unpack(&self, target: &Path, reference: &str, local: bool) -> Result<Option<String>> {
            self.calls
                .lock()
                .unwrap()
                .push((target.to_path_buf(), reference.to_string(), local));
            if self.fail {
                return Err(anyhow::anyhow!("pull failed"));
            }
            fs::write(target.join("marker"), reference)?;
            Ok(Some("sha256:feed".to_string()))
        }

        fn unpack_channel(&self, target: &Path, reference: &str) -> Result<Option<String>> {
            self.unpack(target, reference, false)
        }
    }

    fn config(hal: &FakeHal, unpacker: Arc<MarkerUnpacker>) -> Config {
        Config::new(Arc::new(hal.clone()))
            .unwrap()
            .with_unpacker(unpacker)
    }

    fn image(dir: &Path) -> Image {
        let mut img = Image::new(
            dir.join("state/cOS/active.img"),
            constants::ACTIVE_LABEL,
            "ext2",
            dir.join("active"),
        );
        img.size = 1;
        img
    }

    #[test]
    fn mount_partition_resolves_device_by_label() {
        let hal = FakeHal::new();
        hal.set_side_effect(|program, _| match program {
            "lsblk" => Ok(LSBLK_JSON.as_bytes().to_vec()),
            _ => Ok(Vec::new()),
        });
        let dir = tempdir().unwrap();
        let cfg = config(&hal, Arc::default());
        let deployer = Deployer::new(&cfg).with_label_retry(1, Duration::ZERO);
        let mut part = Partition::new("state", "COS_STATE", 0, "ext4", None);
        part.mount_point = Some(dir.path().join("state"));

        deployer.mount_partition(&part, &["rw"]).unwrap();
        assert!(hal.has_operation(|op| matches!(
            op,
            Operation::Mount { device, fstype, .. }
                if device == Path::new("/dev/sda4") && fstype.as_deref() == Some("ext4")
        )));
    }

    #[test]
    fn unmount_partition_skips_unmounted() {
        let hal = FakeHal::new();
        let cfg = config(&hal, Arc::default());
        let part = Partition::new("oem", "COS_OEM", 64, "ext4", Some("/run/cos/oem"));
        Deployer::new(&cfg).unmount_partition(&part).unwrap();
        assert!(hal.operations().is_empty());
    }

    #[test]
    fn partitions_mount_by_depth_and_roll_back_on_failure() {
        let hal = FakeHal::new();
        let dir = tempdir().unwrap();
        let cfg = config(&hal, Arc::default());
        let mut layout = PartitionLayout::default();
        let mut state = Partition::new("state", "COS_STATE", 0, "ext4", None);
        state.mount_point = Some(dir.path().join("state"));
        state.path = Some(PathBuf::from("/dev/sda4"));
        let mut oem = Partition::new("oem", "COS_OEM", 64, "ext4", None);
        oem.mount_point = Some(dir.path().join("state/oem"));
        oem.path = Some(PathBuf::from("/dev/sda2"));
        layout.state = Some(state);
        layout.oem = Some(oem);

        hal.fail_mount(dir.path().join("state/oem"));
        let e = Deployer::new(&cfg).mount_partitions(&layout).unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::MountPartitions));
        assert!(hal.mounted_paths().is_empty());
        assert!(hal.has_operation(|op| matches!(
            op,
            Operation::Unmount { target } if *target == dir.path().join("state")
        )));
    }

    #[test]
    fn mount_image_detaches_loop_on_mount_failure() {
        let hal = FakeHal::new();
        let dir = tempdir().unwrap();
        let cfg = config(&hal, Arc::default());
        let mut img = image(dir.path());
        hal.fail_mount(img.mount_point.clone());

        assert!(Deployer::new(&cfg).mount_image(&mut img, &["rw"]).is_err());
        assert_eq!(img.loop_device, None);
        assert!(hal.has_operation(|op| matches!(op, Operation::LosetupDetach { .. })));
    }

    #[test]
    fn unmount_image_clears_loop_device() {
        let hal = FakeHal::new();
        let dir = tempdir().unwrap();
        let cfg = config(&hal, Arc::default());
        let deployer = Deployer::new(&cfg);
        let mut img = image(dir.path());

        // not mounted: no-op
        deployer.unmount_image(&mut img).unwrap();
        assert!(hal.operations().is_empty());

        deployer.mount_image(&mut img, &["rw"]).unwrap();
        assert_eq!(img.loop_device.as_deref(), Some("/dev/loop0"));
        deployer.unmount_image(&mut img).unwrap();
        assert_eq!(img.loop_device, None);
        assert!(hal.has_operation(|op| matches!(
            op,
            Operation::LosetupDetach { loop_device } if loop_device == "/dev/loop0"
        )));
    }

    #[test]
    fn deploy_from_container_creates_formats_and_fills_image() {
        let hal = FakeHal::new();
        let dir = tempdir().unwrap();
        let unpacker = Arc::new(MarkerUnpacker::default());
        let cfg = config(&hal, unpacker.clone());
        let mut img = image(dir.path()).with_source(ImageSource::Docker("os:v1".to_string()));

        let meta = Deployer::new(&cfg).deploy_image(&mut img, false).unwrap();
        assert_eq!(meta.as_deref(), Some("sha256:feed"));
        assert_eq!(fs::metadata(&img.file).unwrap().len(), MIB);
        assert!(img.mount_point.join("marker").exists());
        assert!(img.mount_point.join("usr/local").is_dir());
        assert!(hal.commands()[0].starts_with(&["mkfs.ext2".to_string(), "-L".to_string()]));
        assert!(hal.mounted_paths().is_empty());
        assert_eq!(img.loop_device, None);
    }

    #[test]
    fn failed_dump_still_unmounts_image() {
        let hal = FakeHal::new();
        let dir = tempdir().unwrap();
        let unpacker = Arc::new(MarkerUnpacker {
            fail: true,
            ..Default::default()
        });
        let cfg = config(&hal, unpacker);
        let mut img = image(dir.path()).with_source(ImageSource::Docker("os:v1".to_string()));

        let e = Deployer::new(&cfg).deploy_image(&mut img, true).unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::DumpSource));
        assert!(hal.mounted_paths().is_empty());
        assert!(hal.has_operation(|op| matches!(op, Operation::LosetupDetach { .. })));
    }

    #[test]
    fn deploy_from_file_copies_and_relabels() {
        let hal = FakeHal::new();
        let dir = tempdir().unwrap();
        let src = dir.path().join("source.img");
        fs::write(&src, b"image bytes").unwrap();
        let cfg = config(&hal, Arc::default());
        let mut img = image(dir.path()).with_source(ImageSource::File(src));
        img.label = constants::PASSIVE_LABEL.to_string();

        Deployer::new(&cfg).deploy_image(&mut img, false).unwrap();
        assert_eq!(fs::read(&img.file).unwrap(), b"image bytes");
        let file = img.file.to_string_lossy().to_string();
        hal.cmds_match(&[&["tune2fs", "-L", "COS_PASSIVE", &file]]).unwrap();
    }

    #[test]
    fn deploy_squashfs_packs_a_temporary_tree() {
        let hal = FakeHal::new();
        let dir = tempdir().unwrap();
        let cfg = config(&hal, Arc::default());
        let mut img = Image::new(
            dir.path().join("recovery/cOS/recovery.squashfs"),
            constants::SYSTEM_LABEL,
            constants::SQUASH_FS,
            dir.path().join("transition"),
        )
        .with_source(ImageSource::Dir(PathBuf::from("/srv/rootfs")));

        Deployer::new(&cfg).deploy_image(&mut img, false).unwrap();
        let cmds = hal.commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0][0], "mksquashfs");
        assert_eq!(cmds[0][2], img.file.to_string_lossy());
        assert!(cmds[0].contains(&"xz".to_string()));
        // the temporary tree is gone
        assert!(!Path::new(&cmds[0][1]).exists());
    }

    #[test]
    fn dump_dir_excludes_runtime_dirs() {
        let hal = FakeHal::new();
        let cfg = config(&hal, Arc::default());
        Deployer::new(&cfg)
            .dump_source(
                Path::new("/run/cos/active"),
                &ImageSource::Dir(PathBuf::from("/srv/rootfs")),
            )
            .unwrap();
        assert!(hal.has_operation(|op| matches!(
            op,
            Operation::CopyTree { src, dst }
                if src == Path::new("/srv/rootfs") && dst == Path::new("/run/cos/active")
        )));
    }

    #[test]
    fn cloud_config_files_are_numbered() {
        let hal = FakeHal::new();
        let dir = tempdir().unwrap();
        let src = dir.path().join("user.yaml");
        fs::write(&src, "#cloud-config\n").unwrap();
        let cfg = config(&hal, Arc::default());
        let oem = dir.path().join("oem");

        Deployer::new(&cfg)
            .copy_cloud_config(&oem, &[src.to_string_lossy().to_string()])
            .unwrap();
        let dest = oem.join("99_custom_0.yaml");
        assert_eq!(fs::read_to_string(&dest).unwrap(), "#cloud-config\n");
        assert_eq!(fs::metadata(&dest).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn selinux_relabel_is_best_effort() {
        let hal = FakeHal::new();
        hal.set_side_effect(|program, _| {
            Err(HalError::CommandFailed {
                program: program.to_string(),
                code: Some(1),
                stderr: "bad policy".to_string(),
            })
        });
        let dir = tempdir().unwrap();
        let cfg = config(&hal, Arc::default());
        let deployer = Deployer::new(&cfg);

        // no contexts file: nothing runs
        deployer.selinux_relabel(dir.path(), true).unwrap();
        assert!(hal.commands().is_empty());

        let ctx = dir.path().join(constants::SELINUX_TARGETED_CONTEXT_FILE.trim_start_matches('/'));
        fs::create_dir_all(ctx.parent().unwrap()).unwrap();
        fs::write(&ctx, "").unwrap();
        let policy = dir.path().join(constants::SELINUX_TARGETED_POLICY_DIR.trim_start_matches('/'));
        fs::create_dir_all(&policy).unwrap();
        fs::write(policy.join("policy.33"), "").unwrap();

        deployer.selinux_relabel(dir.path(), false).unwrap();
        assert!(hal.has_command("setfiles"));
        let e = deployer.selinux_relabel(dir.path(), true).unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::SelinuxRelabel));
        assert!(hal.mounted_paths().is_empty());
    }

    #[test]
    fn active_deployment_is_detected_by_label() {
        let hal = FakeHal::new();
        hal.set_side_effect(|_, args| {
            if args.iter().any(|a| a == "COS_PASSIVE") {
                Ok(b"/dev/loop3\n".to_vec())
            } else {
                Err(HalError::CommandFailed {
                    program: "blkid".to_string(),
                    code: Some(2),
                    stderr: String::new(),
                })
            }
        });
        let cfg = config(&hal, Arc::default());
        assert!(Deployer::new(&cfg).check_active_deployment());

        let clean = FakeHal::new();
        clean.set_side_effect(|p, _| Err(HalError::CommandNotFound(p.to_string())));
        let cfg = config(&clean, Arc::default());
        assert!(!Deployer::new(&cfg).check_active_deployment());
    }
}
