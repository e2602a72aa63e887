#![allow(dead_code)]

use anyhow::Result;
use cairn_core::config::{Config, RunConfig};
use cairn_core::hooks::StageRunner;
use cairn_core::types::{Image, PartitionLayout};
use cairn_core::unpack::Unpacker;
use cairn_hal::FakeHal;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LAST_SECTOR: u64 = 50593792;

/// Stage runner recording every stage and failing the listed ones.
#[derive(Default)]
pub struct Stages {
    pub calls: Mutex<Vec<String>>,
    pub failing: Vec<String>,
}

impl Stages {
    pub fn failing(stage: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: vec![stage.to_string()],
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl StageRunner for Stages {
    fn run(&self, stage: &str, _paths: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(stage.to_string());
        if self.failing.iter().any(|s| s == stage) {
            anyhow::bail!("stage {stage} failed");
        }
        Ok(())
    }
}

/// Unpacker dropping a release file into the target tree.
pub struct ReleaseUnpacker;

impl Unpacker for ReleaseUnpacker {
    fn unpack(&self, target: &Path, reference: &str, _local: bool) -> Result<Option<String>> {
        fs::create_dir_all(target.join("etc"))?;
        fs::write(target.join("etc/os-release"), reference)?;
        Ok(Some(format!("sha256:{}", reference.len())))
    }

    fn unpack_channel(&self, target: &Path, reference: &str) -> Result<Option<String>> {
        self.unpack(target, reference, false)
    }
}

pub fn run_config(hal: &FakeHal, stages: Arc<Stages>, strict: bool) -> RunConfig {
    let cfg = Config::new(Arc::new(hal.clone()))
        .unwrap()
        .with_stage_runner(stages)
        .with_unpacker(Arc::new(ReleaseUnpacker))
        .with_strict(strict);
    let mut run = RunConfig::new(cfg);
    run.power_delay = Duration::ZERO;
    run
}

/// `path` moved under `root`.
pub fn rebase(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

pub fn rebase_layout(root: &Path, layout: &mut PartitionLayout) {
    for part in [
        &mut layout.efi,
        &mut layout.oem,
        &mut layout.recovery,
        &mut layout.state,
        &mut layout.persistent,
    ]
    .into_iter()
    .flatten()
    {
        if let Some(mp) = part.mount_point.take() {
            part.mount_point = Some(rebase(root, &mp));
        }
    }
}

pub fn rebase_image(root: &Path, img: &mut Image) {
    img.file = rebase(root, &img.file);
    img.mount_point = rebase(root, &img.mount_point);
    img.size = 1;
}

/// Create a grub config in the tree `root`, as a deployed system ships it.
pub fn seed_grub_cfg(root: &Path) {
    let dir = root.join("etc/cos");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("grub.cfg"), "linux /boot/vmlinuz console=tty1\n").unwrap();
}

#[derive(Debug, Default)]
struct FakeDisk {
    label: String,
    parts: Vec<(u64, u64)>,
}

impl FakeDisk {
    fn print(&self, device: &str) -> String {
        let label = if self.label.is_empty() { "unknown" } else { &self.label };
        let mut out = format!("BYT;\n{device}:{LAST_SECTOR}s:scsi:512:512:{label}:Fake disk:;\n");
        for (idx, (start, end)) in self.parts.iter().enumerate() {
            out.push_str(&format!(
                "{}:{}s:{}s:{}s:ext4::;\n",
                idx + 1,
                start,
                end,
                end - start + 1
            ));
        }
        out
    }

    fn apply(&mut self, ops: &[String]) {
        let mut ops = ops.iter();
        while let Some(op) = ops.next() {
            match op.as_str() {
                "mklabel" => {
                    self.label = ops.next().cloned().unwrap_or_default();
                    self.parts.clear();
                }
                "mkpart" => {
                    let _name = ops.next();
                    let _fs = ops.next();
                    let start = ops.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                    let end = match ops.next().map(String::as_str) {
                        Some("100%") | None => LAST_SECTOR - 1,
                        Some(end) => end.parse().unwrap_or(0),
                    };
                    self.parts.push((start, end));
                }
                "rm" => {
                    if let Some(n) = ops.next().and_then(|n| n.parse::<usize>().ok()) {
                        self.parts.remove(n - 1);
                    }
                }
                "set" => {
                    ops.nth(2);
                }
                _ => {}
            }
        }
    }

    fn lsblk(&self, device: &str) -> String {
        let mut out = format!("{device} disk\n");
        for n in 1..=self.parts.len() {
            out.push_str(&format!("{device}{n} part\n"));
        }
        out
    }
}

/// Script `parted` and `lsblk` on `hal` to behave like an empty disk at `device`.
pub fn fake_disk(hal: &FakeHal, device: &str) {
    let disk = Arc::new(Mutex::new(FakeDisk::default()));
    let device = device.to_string();
    hal.set_side_effect(move |program, args| {
        let mut disk = disk.lock().unwrap();
        let out = match program {
            "parted" => {
                let ops = &args[6..];
                if ops == ["print"] {
                    disk.print(&device)
                } else {
                    disk.apply(ops);
                    String::new()
                }
            }
            "lsblk" if args.first().map(String::as_str) == Some("-ltnpo") => disk.lsblk(&device),
            _ => String::new(),
        };
        Ok(out.into_bytes())
    });
}

/// Partition devices created on the fake disk, with their filesystem labels.
pub fn mkfs_labels(hal: &FakeHal) -> Vec<(String, String)> {
    hal.commands()
        .into_iter()
        .filter(|cmd| cmd[0].starts_with("mkfs."))
        .filter_map(|cmd| {
            let label = cmd.iter().position(|a| a == "-L" || a == "-n").map(|i| cmd[i + 1].clone())?;
            Some((cmd.last()?.clone(), label))
        })
        .collect()
}

/// `lsblk -J` output for a disk `/dev/sda` carrying the five cairn partitions.
///
/// Partitions listed in `mounts` are reported as mounted at the given path.
pub fn lsblk_json(mounts: &[(&str, &Path)]) -> String {
    let parts = [
        ("COS_GRUB", "vfat", 64u64),
        ("COS_OEM", "ext4", 64),
        ("COS_RECOVERY", "ext4", 8192),
        ("COS_STATE", "ext4", 15360),
        ("COS_PERSISTENT", "ext4", 1024),
    ];
    let mut devices = vec![
        r#"{"label": null, "size": 21474836480, "fstype": null, "mountpoint": null, "path": "/dev/sda", "pkname": null, "type": "disk"}"#
            .to_string(),
    ];
    for (idx, (label, fs, mib)) in parts.iter().enumerate() {
        let mountpoint = mounts
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, p)| format!("\"{}\"", p.display()))
            .unwrap_or_else(|| "null".to_string());
        devices.push(format!(
            r#"{{"label": "{label}", "size": {}, "fstype": "{fs}", "mountpoint": {mountpoint}, "path": "/dev/sda{}", "pkname": "/dev/sda", "type": "part"}}"#,
            mib * 1024 * 1024,
            idx + 1
        ));
    }
    format!("{{\"blockdevices\": [{}]}}", devices.join(",\n"))
}

/// Script `lsblk` to report `json`; every other command succeeds silently.
pub fn fake_lsblk(hal: &FakeHal, json: String) {
    hal.set_side_effect(move |program, _| match program {
        "lsblk" => Ok(json.clone().into_bytes()),
        _ => Ok(Vec::new()),
    });
}
