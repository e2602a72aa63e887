//! Disk layout model.
//!
//! A [`Disk`] caches what `parted` reports about one block device. Every
//! structural change is followed by a reload; cached values are never reused
//! across a write.

use super::mkfs;
use super::parted::{PartInfo, PartedCall, PartitionSpec};
use crate::constants;
use crate::errors::{err, ErrorKind, Result};
use anyhow::Context;
use cairn_hal::{MountGuard, MountOptions, SystemHal};
use std::path::Path;
use std::thread;
use std::time::Duration;

const PARTITION_TRIES: u32 = 10;
const PARTITION_BACKOFF: Duration = Duration::from_secs(1);

pub struct Disk<'a, H: SystemHal + ?Sized> {
    device: String,
    hal: &'a H,
    sector_size: u64,
    last_sector: u64,
    label: String,
    parts: Vec<PartInfo>,
    tries: u32,
    backoff: Duration,
}

impl<'a, H: SystemHal + ?Sized> Disk<'a, H> {
    pub fn new(device: &str, hal: &'a H) -> Self {
        Self {
            device: device.to_string(),
            hal,
            sector_size: 0,
            last_sector: 0,
            label: String::new(),
            parts: Vec::new(),
            tries: PARTITION_TRIES,
            backoff: PARTITION_BACKOFF,
        }
    }

    /// Override how long to wait for partition device nodes to appear.
    pub fn with_retry(mut self, tries: u32, backoff: Duration) -> Self {
        self.tries = tries.max(1);
        self.backoff = backoff;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn exists(&self) -> bool {
        Path::new(&self.device).exists()
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    pub fn last_sector(&self) -> u64 {
        self.last_sector
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn partitions(&self) -> &[PartInfo] {
        &self.parts
    }

    fn parted(&self) -> PartedCall<'a, H> {
        let mut pc = PartedCall::new(&self.device, self.hal);
        pc.set_label(&self.label);
        pc
    }

    /// Re-read sector size, last sector, table label and partitions.
    pub fn reload(&mut self) -> Result<()> {
        let layout = self.parted().read_layout()?;
        self.sector_size = layout.sector_size;
        self.last_sector = layout.last_sector;
        self.label = layout.label;
        self.parts = layout.partitions;
        Ok(())
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if self.sector_size == 0 {
            self.reload()?;
        }
        Ok(())
    }

    pub fn mib_to_sectors(&self, size: u64) -> u64 {
        if self.sector_size == 0 {
            return 0;
        }
        size * 1024 * 1024 / self.sector_size
    }

    /// First sector usable by a partition (1 MiB aligned).
    fn first_sector(&self) -> u64 {
        if self.sector_size == 0 {
            return 0;
        }
        constants::FIRST_PARTITION_OFFSET / self.sector_size
    }

    /// Free sectors after the last partition.
    pub fn free_space(&self) -> u64 {
        match self.parts.last() {
            Some(last) => self
                .last_sector
                .saturating_sub(last.start_s + last.size_s - 1),
            None => self.last_sector.saturating_sub(self.first_sector().saturating_sub(1)),
        }
    }

    /// Free sectors the last partition could grow into.
    fn free_space_without_last(&self) -> u64 {
        if self.parts.len() > 1 {
            let prev = &self.parts[self.parts.len() - 2];
            self.last_sector.saturating_sub(prev.start_s + prev.size_s - 1)
        } else {
            self.last_sector.saturating_sub(self.first_sector().saturating_sub(1))
        }
    }

    /// Whether `size` MiB fit into the unpartitioned space.
    pub fn check_free_space_mib(&mut self, size: u64) -> Result<bool> {
        self.ensure_loaded()?;
        Ok(self.mib_to_sectors(size) <= self.free_space())
    }

    /// Replace the partition table with an empty `gpt` or `msdos` one.
    pub fn new_partition_table(&mut self, label: &str) -> Result<String> {
        if label != constants::GPT && label != constants::MSDOS {
            return Err(err(
                ErrorKind::InvalidPartitionTable,
                format!("'{label}' is not one of gpt, msdos"),
            ));
        }
        let mut pc = self.parted();
        pc.create_table(label);
        let out = pc.write_changes()?;
        self.reload()?;
        Ok(out)
    }

    /// Append a partition after the current last one and return its number.
    ///
    /// `size` is in MiB, 0 takes all the remaining space. The request is
    /// rejected before touching the table when it does not fit.
    pub fn add_partition(&mut self, size: u64, fs: &str, name: &str, flags: &[String]) -> Result<u32> {
        self.ensure_loaded()?;

        let size_s = self.mib_to_sectors(size);
        let free = self.free_space();
        if size_s > free {
            return Err(err(
                ErrorKind::NotEnoughSpace,
                format!(
                    "requested {size_s} sectors for '{name}' but only {free} are free on {}",
                    self.device
                ),
            ));
        }

        let (number, start_s) = match self.parts.last() {
            Some(last) => (last.number + 1, last.start_s + last.size_s),
            None => (1, self.first_sector()),
        };

        let mut pc = self.parted();
        pc.create_partition(PartitionSpec {
            number,
            start_s,
            size_s,
            name: name.to_string(),
            fs: fs.to_string(),
        });
        for flag in flags {
            pc.set_partition_flag(number, flag, true);
        }
        pc.write_changes()?;
        self.reload()?;
        Ok(number)
    }

    /// Recreate the last partition with a larger end and grow its filesystem.
    ///
    /// `size` is in MiB; 0 grows to the end of the disk. Returns the device
    /// path of the expanded partition.
    pub fn expand_last_partition(&mut self, size: u64) -> Result<String> {
        self.ensure_loaded()?;

        let Some(part) = self.parts.last().cloned() else {
            return Err(err(ErrorKind::NoPartitions, self.device.clone()));
        };

        let size_s = if size > 0 {
            let size_s = self.mib_to_sectors(size);
            if size_s < part.size_s {
                return Err(err(
                    ErrorKind::CannotShrink,
                    format!(
                        "partition {} is {} sectors, requested {size_s}",
                        part.number, part.size_s
                    ),
                ));
            }
            let free = self.free_space_without_last();
            if size_s > free {
                return Err(err(
                    ErrorKind::NotEnoughSpace,
                    format!("requested {size_s} sectors but only {free} are available"),
                ));
            }
            size_s
        } else {
            0
        };

        let mut pc = self.parted();
        pc.delete_partition(part.number);
        pc.create_partition(PartitionSpec {
            number: part.number,
            start_s: part.start_s,
            size_s,
            name: part.name.clone(),
            fs: part.fs.clone(),
        });
        pc.write_changes()?;
        self.reload()?;

        let device = self.find_partition_device(part.number)?;
        self.expand_filesystem(&device)?;
        Ok(device)
    }

    fn expand_filesystem(&self, device: &str) -> Result<()> {
        let fs = self
            .hal
            .run_string("blkid", &[device, "-s", "TYPE", "-o", "value"])
            .with_context(|| format!("failed to detect filesystem of {device}"))?;
        let fs = fs.trim();

        match fs {
            "ext2" | "ext3" | "ext4" => {
                self.hal
                    .run("e2fsck", &["-fy", device])
                    .with_context(|| format!("e2fsck failed on {device}"))?;
                self.hal
                    .run("resize2fs", &[device])
                    .with_context(|| format!("resize2fs failed on {device}"))?;
            }
            "xfs" => {
                // xfs only grows while mounted.
                let tmp = tempfile::Builder::new()
                    .prefix("cairn-xfs-")
                    .tempdir()
                    .context("failed to create temporary mount point")?;
                self.hal
                    .mount_device(Path::new(device), tmp.path(), Some("xfs"), &MountOptions::new())
                    .with_context(|| format!("failed to mount {device}"))?;
                let guard = MountGuard::new(self.hal, tmp.path());
                let mnt = tmp.path().to_string_lossy().to_string();
                self.hal
                    .run("xfs_growfs", &[mnt.as_str()])
                    .with_context(|| format!("xfs_growfs failed on {device}"))?;
                let target = guard.release();
                self.hal
                    .unmount(&target)
                    .with_context(|| format!("failed to unmount {}", target.display()))?;
            }
            other => {
                return Err(err(
                    ErrorKind::UnsupportedFilesystem,
                    format!("cannot grow '{other}' filesystem on {device}"),
                ));
            }
        }
        Ok(())
    }

    /// Device node of partition `number`, waiting for udev to create it.
    pub fn find_partition_device(&self, number: u32) -> Result<String> {
        for attempt in 1..=self.tries {
            log::debug!(
                "Looking for partition {} of {} (try {}/{})",
                number,
                self.device,
                attempt,
                self.tries
            );
            let _ = self.hal.run("udevadm", &["settle"]);
            match self.hal.run_string("lsblk", &["-ltnpo", "name,type", &self.device]) {
                Ok(out) => {
                    if let Some(dev) = match_partition_device(&out, number) {
                        return Ok(dev);
                    }
                }
                Err(e) => log::debug!("lsblk failed on {}: {}", self.device, e),
            }
            if attempt < self.tries {
                thread::sleep(self.backoff);
            }
        }
        Err(err(
            ErrorKind::PartitionDeviceNotFound,
            format!("partition {number} of {}", self.device),
        ))
    }

    /// Format partition `number` with `fs` and `label`.
    pub fn format_partition(&self, number: u32, fs: &str, label: &str) -> Result<String> {
        let device = self.find_partition_device(number)?;
        mkfs::format_device(self.hal, &device, fs, label, &[])?;
        Ok(device)
    }

    /// Clear filesystem and partition-table signatures from the whole device.
    pub fn wipe_signatures(&self) -> Result<()> {
        self.hal
            .run("wipefs", &["--all", &self.device])
            .with_context(|| format!("failed to wipe {}", self.device))?;
        Ok(())
    }
}

/// Find the `part` entry of `lsblk -ltnpo name,type` whose name ends in `number`.
fn match_partition_device(lsblk: &str, number: u32) -> Option<String> {
    let suffix = number.to_string();
    lsblk.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        if fields.next()? != "part" {
            return None;
        }
        let prefix = name.strip_suffix(suffix.as_str())?;
        if prefix.ends_with(|c: char| c.is_ascii_digit()) || prefix.is_empty() {
            return None;
        }
        Some(name.to_string())
    })
}
