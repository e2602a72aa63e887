use crate::constants;
use crate::errors::{err, ErrorKind, Result};
use std::path::PathBuf;

/// A partition of the target layout.
///
/// `size` is in MiB; 0 means "claim all remaining free space". `path` is only
/// known once the partition exists on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub filesystem_label: String,
    pub size: u64,
    pub fs: String,
    pub flags: Vec<String>,
    pub mount_point: Option<PathBuf>,
    pub path: Option<PathBuf>,
    pub disk: Option<String>,
}

impl Partition {
    pub fn new(name: &str, label: &str, size: u64, fs: &str, mount_point: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            filesystem_label: label.to_string(),
            size,
            fs: fs.to_string(),
            flags: Vec::new(),
            mount_point: mount_point.map(PathBuf::from),
            path: None,
            disk: None,
        }
    }

    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        for flag in flags {
            self.add_flag(flag);
        }
        self
    }

    pub fn add_flag(&mut self, flag: &str) {
        if !self.flags.iter().any(|f| f == flag) {
            self.flags.push(flag.to_string());
        }
    }

    /// Number of path components of the mount point, or 0 without one.
    pub fn mount_depth(&self) -> usize {
        self.mount_point
            .as_ref()
            .map(|p| p.components().count())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    Bios,
    Efi,
}

/// The fixed partition layout of a cairn system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionLayout {
    pub bios: Option<Partition>,
    pub efi: Option<Partition>,
    pub oem: Option<Partition>,
    pub recovery: Option<Partition>,
    pub state: Option<Partition>,
    pub persistent: Option<Partition>,
}

impl PartitionLayout {
    /// Default OEM, recovery, state and persistent partitions.
    pub fn with_defaults() -> Self {
        Self {
            bios: None,
            efi: None,
            oem: Some(Partition::new(
                constants::OEM_PART_NAME,
                constants::OEM_LABEL,
                constants::OEM_SIZE,
                constants::LINUX_FS,
                Some(constants::OEM_DIR),
            )),
            recovery: Some(Partition::new(
                constants::RECOVERY_PART_NAME,
                constants::RECOVERY_LABEL,
                constants::RECOVERY_SIZE,
                constants::LINUX_FS,
                Some(constants::RECOVERY_DIR),
            )),
            state: Some(Partition::new(
                constants::STATE_PART_NAME,
                constants::STATE_LABEL,
                constants::STATE_SIZE,
                constants::LINUX_FS,
                Some(constants::STATE_DIR),
            )),
            persistent: Some(Partition::new(
                constants::PERSISTENT_PART_NAME,
                constants::PERSISTENT_LABEL,
                constants::PERSISTENT_SIZE,
                constants::LINUX_FS,
                Some(constants::PERSISTENT_DIR),
            )),
        }
    }

    /// Populates the boot-firmware slot for the given firmware and table type.
    ///
    /// EFI requires GPT and gets an ESP, keeping the mount point of an
    /// ESP already in the layout; BIOS on GPT gets a `bios_grub`
    /// partition; BIOS on MSDOS gets none and flags State as bootable.
    pub fn set_firmware_partitions(&mut self, firmware: Firmware, table: &str) -> Result<()> {
        self.bios = None;
        let efi_mount = self.efi.take().and_then(|p| p.mount_point);
        match (firmware, table) {
            (Firmware::Efi, constants::GPT) => {
                let mut esp = Partition::new(
                    constants::EFI_PART_NAME,
                    constants::EFI_LABEL,
                    constants::EFI_SIZE,
                    constants::EFI_FS,
                    Some(constants::EFI_DIR),
                )
                .with_flags(&[constants::ESP_FLAG]);
                if efi_mount.is_some() {
                    esp.mount_point = efi_mount;
                }
                self.efi = Some(esp);
            }
            (Firmware::Efi, other) => {
                return Err(err(
                    ErrorKind::InvalidLayout,
                    format!("EFI firmware requires a gpt partition table, got '{other}'"),
                ));
            }
            (Firmware::Bios, constants::GPT) => {
                self.bios = Some(
                    Partition::new(constants::BIOS_PART_NAME, "", constants::BIOS_SIZE, "", None)
                        .with_flags(&[constants::BIOS_GRUB_FLAG]),
                );
            }
            (Firmware::Bios, constants::MSDOS) => {
                if let Some(state) = self.state.as_mut() {
                    state.add_flag(constants::BOOT_FLAG);
                }
            }
            (Firmware::Bios, other) => {
                return Err(err(
                    ErrorKind::InvalidPartitionTable,
                    format!("unsupported partition table '{other}'"),
                ));
            }
        }
        Ok(())
    }

    /// The populated slot whose partition is called `name`.
    pub fn get_mut_by_name(&mut self, name: &str) -> Option<&mut Partition> {
        [
            &mut self.bios,
            &mut self.efi,
            &mut self.oem,
            &mut self.recovery,
            &mut self.state,
            &mut self.persistent,
        ]
        .into_iter()
        .flatten()
        .find(|p| p.name == name)
    }

    /// All populated partitions, in install order, without extras.
    pub fn to_list(&self) -> Vec<Partition> {
        [
            &self.bios,
            &self.efi,
            &self.oem,
            &self.recovery,
            &self.state,
            &self.persistent,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }

    /// Partitions in the order they are created on disk.
    ///
    /// Boot firmware first, then OEM, Recovery, State, Persistent and the
    /// extra partitions. The zero-size partition, if any, goes last.
    pub fn partitions_by_install_order(&self, extra: &[Partition]) -> Result<Vec<Partition>> {
        let mut ordered = Vec::new();
        let mut last: Option<Partition> = None;
        for part in self.to_list().into_iter().chain(extra.iter().cloned()) {
            if part.size == 0 {
                if let Some(prev) = &last {
                    return Err(err(
                        ErrorKind::InvalidLayout,
                        format!(
                            "only one partition can claim the remaining space, found '{}' and '{}'",
                            prev.name, part.name
                        ),
                    ));
                }
                last = Some(part);
            } else {
                ordered.push(part);
            }
        }
        ordered.extend(last);
        Ok(ordered)
    }

    /// Partitions with a mount point, shallowest first (or deepest first when `descending`).
    pub fn ordered_by_mount_point(&self, descending: bool) -> Vec<Partition> {
        let mut parts: Vec<Partition> = self
            .to_list()
            .into_iter()
            .filter(|p| p.mount_point.is_some())
            .collect();
        parts.sort_by_key(Partition::mount_depth);
        if descending {
            parts.reverse();
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn efi_gpt_layout_has_esp() {
        let mut layout = PartitionLayout::with_defaults();
        layout.set_firmware_partitions(Firmware::Efi, "gpt").unwrap();
        let efi = layout.efi.as_ref().unwrap();
        assert_eq!(efi.flags, vec!["esp"]);
        assert_eq!(efi.fs, "vfat");
        assert!(layout.bios.is_none());
    }

    #[test]
    fn relocated_esp_keeps_its_mount_point() {
        let mut layout = PartitionLayout::with_defaults();
        layout.set_firmware_partitions(Firmware::Efi, "gpt").unwrap();
        layout.efi.as_mut().unwrap().mount_point = Some(PathBuf::from("/boot/efi"));
        layout.set_firmware_partitions(Firmware::Efi, "gpt").unwrap();
        assert_eq!(
            layout.efi.as_ref().unwrap().mount_point,
            Some(PathBuf::from("/boot/efi"))
        );
    }

    #[test]
    fn bios_gpt_layout_has_bios_grub() {
        let mut layout = PartitionLayout::with_defaults();
        layout.set_firmware_partitions(Firmware::Bios, "gpt").unwrap();
        assert!(layout.efi.is_none());
        assert_eq!(layout.bios.as_ref().unwrap().flags, vec!["bios_grub"]);
    }

    #[test]
    fn msdos_layout_flags_state_bootable() {
        let mut layout = PartitionLayout::with_defaults();
        layout.set_firmware_partitions(Firmware::Bios, "msdos").unwrap();
        assert!(layout.efi.is_none() && layout.bios.is_none());
        assert_eq!(layout.state.as_ref().unwrap().flags, vec!["boot"]);
    }

    #[test]
    fn efi_with_msdos_is_rejected() {
        let mut layout = PartitionLayout::with_defaults();
        let e = layout.set_firmware_partitions(Firmware::Efi, "msdos").unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::InvalidLayout));
    }

    #[test]
    fn zero_sized_partition_goes_last() {
        let mut layout = PartitionLayout::with_defaults();
        layout.set_firmware_partitions(Firmware::Efi, "gpt").unwrap();
        let extra = vec![Partition::new("data", "DATA", 100, "ext4", None)];
        let names: Vec<String> = layout
            .partitions_by_install_order(&extra)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(
            names,
            vec!["efi", "oem", "recovery", "state", "data", "persistent"]
        );
    }

    #[test]
    fn two_zero_sized_partitions_are_rejected() {
        let layout = PartitionLayout::with_defaults();
        let extra = vec![Partition::new("data", "DATA", 0, "ext4", None)];
        let e = layout.partitions_by_install_order(&extra).unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::InvalidLayout));
    }

    #[test]
    fn mount_order_follows_depth() {
        let mut layout = PartitionLayout::with_defaults();
        layout.oem.as_mut().unwrap().mount_point = Some(PathBuf::from("/run/cos/state/oem"));
        let asc: Vec<String> = layout
            .ordered_by_mount_point(false)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(asc.last().map(String::as_str), Some("oem"));
        let desc = layout.ordered_by_mount_point(true);
        assert_eq!(desc[0].name, "oem");
    }
}
