//! Discovery of existing partitions by filesystem label.

use crate::constants;
use crate::errors::{err, ErrorKind, KindContext, Result};
use crate::types::{Partition, PartitionLayout};
use cairn_hal::SystemHal;
use serde::Deserialize;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

/// `lsblk -b` reports sizes as numbers on recent versions and as strings on older ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LsblkSize {
    Bytes(u64),
    Text(String),
}

impl LsblkSize {
    fn bytes(&self) -> u64 {
        match self {
            LsblkSize::Bytes(b) => *b,
            LsblkSize::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    label: Option<String>,
    size: Option<LsblkSize>,
    fstype: Option<String>,
    mountpoint: Option<String>,
    path: Option<String>,
    pkname: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl LsblkDevice {
    fn into_partition(self) -> Partition {
        Partition {
            name: String::new(),
            filesystem_label: self.label.unwrap_or_default(),
            size: self.size.map(|s| s.bytes() / (1024 * 1024)).unwrap_or(0),
            fs: self.fstype.unwrap_or_default(),
            flags: Vec::new(),
            mount_point: self.mountpoint.filter(|m| !m.is_empty()).map(PathBuf::from),
            path: self.path.map(PathBuf::from),
            disk: self.pkname.map(|d| {
                if d.starts_with("/dev/") {
                    d
                } else {
                    format!("/dev/{d}")
                }
            }),
        }
    }
}

/// Parse `lsblk -J` output into the partitions it lists.
pub fn parse_lsblk_json(output: &str) -> Result<Vec<Partition>> {
    let parsed: LsblkOutput = serde_json::from_str(output)
        .map_err(|e| err(ErrorKind::Parse, format!("invalid lsblk output: {e}")))?;
    Ok(parsed
        .blockdevices
        .into_iter()
        .filter(|d| d.kind.as_deref().map_or(true, |k| k == "part"))
        .map(LsblkDevice::into_partition)
        .collect())
}

/// All partitions currently known to the kernel.
pub fn all_partitions<H: SystemHal + ?Sized>(hal: &H) -> Result<Vec<Partition>> {
    let out = hal
        .run_string(
            "lsblk",
            &[
                "-p",
                "-b",
                "-n",
                "-J",
                "-l",
                "--output",
                "LABEL,SIZE,FSTYPE,MOUNTPOINT,PATH,PKNAME,TYPE",
            ],
        )
        .kind(ErrorKind::CommandRun)?;
    parse_lsblk_json(&out)
}

/// Find the partition labelled `label`, waiting for udev between attempts.
pub fn find_partition_by_label<H: SystemHal + ?Sized>(
    hal: &H,
    label: &str,
    tries: u32,
    backoff: Duration,
) -> Result<Partition> {
    for attempt in 1..=tries.max(1) {
        let found = all_partitions(hal)?
            .into_iter()
            .find(|p| p.filesystem_label == label);
        if let Some(part) = found {
            return Ok(part);
        }
        if attempt < tries {
            log::debug!("partition {} not found yet (attempt {}/{})", label, attempt, tries);
            if let Err(e) = hal.run("udevadm", &["settle"]) {
                log::warn!("udevadm settle failed: {}", e);
            }
            sleep(backoff);
        }
    }
    Err(err(
        ErrorKind::MissingPartition,
        format!("no partition labelled {label}"),
    ))
}

/// Whether the running system was booted from the partition or image labelled `label`.
pub fn booted_from<H: SystemHal + ?Sized>(hal: &H, label: &str) -> bool {
    match hal.proc_cmdline() {
        Ok(cmdline) => cmdline.contains(label),
        Err(e) => {
            log::warn!("could not read kernel cmdline: {}", e);
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Active,
    Passive,
    Recovery,
    Unknown,
}

/// Which deployment the running system booted from.
pub fn boot_state<H: SystemHal + ?Sized>(hal: &H) -> BootState {
    if booted_from(hal, constants::ACTIVE_LABEL) {
        BootState::Active
    } else if booted_from(hal, constants::PASSIVE_LABEL) {
        BootState::Passive
    } else if booted_from(hal, constants::SYSTEM_LABEL)
        || booted_from(hal, constants::RECOVERY_SQUASH_FILE)
    {
        BootState::Recovery
    } else {
        BootState::Unknown
    }
}

/// Rebuild the fixed layout from the partitions found on the host.
///
/// Slots whose label is not found stay empty. Partitions that are not
/// mounted get the default mount point of their slot.
pub fn layout_from_labels<H: SystemHal + ?Sized>(hal: &H) -> Result<PartitionLayout> {
    let found = all_partitions(hal)?;
    let pick = |label: &str, name: &str, dir: &str| {
        found
            .iter()
            .find(|p| p.filesystem_label == label)
            .cloned()
            .map(|mut p| {
                p.name = name.to_string();
                if p.mount_point.is_none() {
                    p.mount_point = Some(PathBuf::from(dir));
                }
                p
            })
    };
    Ok(PartitionLayout {
        bios: None,
        efi: pick(constants::EFI_LABEL, constants::EFI_PART_NAME, constants::EFI_DIR),
        oem: pick(constants::OEM_LABEL, constants::OEM_PART_NAME, constants::OEM_DIR),
        recovery: pick(
            constants::RECOVERY_LABEL,
            constants::RECOVERY_PART_NAME,
            constants::RECOVERY_DIR,
        ),
        state: pick(constants::STATE_LABEL, constants::STATE_PART_NAME, constants::STATE_DIR),
        persistent: pick(
            constants::PERSISTENT_LABEL,
            constants::PERSISTENT_PART_NAME,
            constants::PERSISTENT_DIR,
        ),
    })
}
