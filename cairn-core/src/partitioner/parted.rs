//! `parted` driver.
//!
//! Mutations are queued and flushed with a single `parted` invocation so a
//! table change is one unit of work. Reads use the machine-readable
//! (`--machine`, `unit s`) print format.

use crate::constants;
use crate::errors::{err, ErrorKind, Result};
use anyhow::Context;
use cairn_hal::ProcessOps;

/// One partition line of `parted --machine print`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartInfo {
    pub number: u32,
    /// First sector, inclusive.
    pub start_s: u64,
    /// Size in sectors (`end - start + 1`).
    pub size_s: u64,
    pub fs: String,
    pub name: String,
    pub flags: Vec<String>,
}

/// Parsed `parted --machine print` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskLayout {
    pub sector_size: u64,
    pub last_sector: u64,
    pub label: String,
    pub partitions: Vec<PartInfo>,
}

/// A partition to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSpec {
    pub number: u32,
    pub start_s: u64,
    /// Size in sectors; 0 extends to the end of the disk.
    pub size_s: u64,
    pub name: String,
    pub fs: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PartedOp {
    MkLabel(String),
    MkPart(PartitionSpec),
    Rm(u32),
    Set { number: u32, flag: String, on: bool },
}

pub struct PartedCall<'a, R: ProcessOps + ?Sized> {
    dev: String,
    runner: &'a R,
    label: String,
    ops: Vec<PartedOp>,
}

impl<'a, R: ProcessOps + ?Sized> PartedCall<'a, R> {
    pub fn new(dev: &str, runner: &'a R) -> Self {
        Self {
            dev: dev.to_string(),
            runner,
            label: String::new(),
            ops: Vec::new(),
        }
    }

    /// Table label used to pick partition names for queued `mkpart`s.
    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    pub fn create_table(&mut self, label: &str) {
        self.label = label.to_string();
        self.ops.push(PartedOp::MkLabel(label.to_string()));
    }

    pub fn create_partition(&mut self, spec: PartitionSpec) {
        self.ops.push(PartedOp::MkPart(spec));
    }

    pub fn delete_partition(&mut self, number: u32) {
        self.ops.push(PartedOp::Rm(number));
    }

    pub fn set_partition_flag(&mut self, number: u32, flag: &str, on: bool) {
        self.ops.push(PartedOp::Set {
            number,
            flag: flag.to_string(),
            on,
        });
    }

    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    /// Arguments of the queued operations, in the order they were queued.
    fn op_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for op in &self.ops {
            match op {
                PartedOp::MkLabel(label) => {
                    args.extend(["mklabel".to_string(), label.clone()]);
                }
                PartedOp::MkPart(spec) => {
                    let name = if self.label == constants::MSDOS || spec.name.is_empty() {
                        "primary".to_string()
                    } else {
                        spec.name.clone()
                    };
                    let end = if spec.size_s == 0 {
                        "100%".to_string()
                    } else {
                        (spec.start_s + spec.size_s - 1).to_string()
                    };
                    args.extend([
                        "mkpart".to_string(),
                        name,
                        parted_fs_type(&spec.fs).to_string(),
                        spec.start_s.to_string(),
                        end,
                    ]);
                }
                PartedOp::Rm(number) => {
                    args.extend(["rm".to_string(), number.to_string()]);
                }
                PartedOp::Set { number, flag, on } => {
                    args.extend([
                        "set".to_string(),
                        number.to_string(),
                        flag.clone(),
                        if *on { "on" } else { "off" }.to_string(),
                    ]);
                }
            }
        }
        args
    }

    /// Flush all queued operations with one `parted` call.
    ///
    /// An empty queue succeeds without running anything.
    pub fn write_changes(&mut self) -> Result<String> {
        if self.ops.is_empty() {
            return Ok(String::new());
        }
        let op_args = self.op_args();
        let mut args: Vec<&str> =
            vec!["--script", "--machine", "--", self.dev.as_str(), "unit", "s"];
        args.extend(op_args.iter().map(String::as_str));

        log::debug!("parted {}", args.join(" "));
        let out = self
            .runner
            .run_string("parted", &args)
            .with_context(|| format!("failed to write partition changes to {}", self.dev))?;
        self.ops.clear();
        Ok(out)
    }

    /// Run `parted ... print` and return the raw machine output.
    pub fn print(&self) -> Result<String> {
        let out = self
            .runner
            .run_string(
                "parted",
                &["--script", "--machine", "--", self.dev.as_str(), "unit", "s", "print"],
            )
            .with_context(|| format!("failed to read partition table of {}", self.dev))?;
        Ok(out)
    }

    /// Read and parse the current layout of the device.
    pub fn read_layout(&self) -> Result<DiskLayout> {
        parse_print_output(&self.print()?)
    }
}

/// `mkpart` filesystem type for a filesystem name.
fn parted_fs_type(fs: &str) -> &str {
    match fs {
        "vfat" | "fat" => "fat32",
        "swap" => "linux-swap",
        other => other,
    }
}

fn parse_sectors(field: &str, line: &str) -> Result<u64> {
    field
        .trim()
        .trim_end_matches('s')
        .parse::<u64>()
        .map_err(|_| err(ErrorKind::Parse, format!("invalid sector value '{field}' in line '{line}'")))
}

/// Parse `parted --script --machine -- <dev> unit s print` output.
///
/// Lines before the `BYT;` marker are ignored. The line after it describes
/// the device; partition lines follow.
pub fn parse_print_output(output: &str) -> Result<DiskLayout> {
    let mut lines = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .skip_while(|l| !matches!(*l, "BYT;" | "CHS;" | "CYL;"));

    if lines.next().is_none() {
        return Err(err(ErrorKind::Parse, "missing 'BYT;' marker in parted output"));
    }

    let device_line = lines
        .next()
        .ok_or_else(|| err(ErrorKind::Parse, "missing device line in parted output"))?;
    let fields: Vec<&str> = device_line.trim_end_matches(';').split(':').collect();
    if fields.len() < 6 {
        return Err(err(
            ErrorKind::Parse,
            format!("malformed device line '{device_line}'"),
        ));
    }
    let last_sector = parse_sectors(fields[1], device_line)?;
    let sector_size = fields[3].parse::<u64>().map_err(|_| {
        err(
            ErrorKind::Parse,
            format!("invalid sector size '{}' in line '{device_line}'", fields[3]),
        )
    })?;
    let label = fields[5].to_string();

    let mut partitions = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
        // Partition lines start with their number; anything else is noise.
        let Ok(number) = fields[0].parse::<u32>() else {
            continue;
        };
        if fields.len() < 4 {
            return Err(err(
                ErrorKind::Parse,
                format!("malformed partition line '{line}'"),
            ));
        }
        let start_s = parse_sectors(fields[1], line)?;
        let end_s = parse_sectors(fields[2], line)?;
        if end_s < start_s {
            return Err(err(
                ErrorKind::Parse,
                format!("partition ends before it starts in line '{line}'"),
            ));
        }
        let flags = fields
            .get(6)
            .map(|f| {
                f.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        partitions.push(PartInfo {
            number,
            start_s,
            size_s: end_s - start_s + 1,
            fs: fields.get(4).map(|s| s.to_string()).unwrap_or_default(),
            name: fields.get(5).map(|s| s.to_string()).unwrap_or_default(),
            flags,
        });
    }

    Ok(DiskLayout {
        sector_size,
        last_sector,
        label,
        partitions,
    })
}
