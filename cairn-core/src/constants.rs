//! Default labels, sizes and paths of the partition layout.

use std::path::Path;

pub const EFI_LABEL: &str = "COS_GRUB";
pub const EFI_PART_NAME: &str = "efi";
pub const EFI_SIZE: u64 = 64;
pub const EFI_FS: &str = "vfat";
pub const EFI_DIR: &str = "/run/cos/efi";

pub const BIOS_PART_NAME: &str = "bios";
pub const BIOS_SIZE: u64 = 1;

pub const OEM_LABEL: &str = "COS_OEM";
pub const OEM_PART_NAME: &str = "oem";
pub const OEM_SIZE: u64 = 64;
pub const OEM_DIR: &str = "/run/cos/oem";

pub const RECOVERY_LABEL: &str = "COS_RECOVERY";
pub const RECOVERY_PART_NAME: &str = "recovery";
pub const RECOVERY_SIZE: u64 = 8192;
pub const RECOVERY_DIR: &str = "/run/cos/recovery";

pub const STATE_LABEL: &str = "COS_STATE";
pub const STATE_PART_NAME: &str = "state";
pub const STATE_SIZE: u64 = 15360;
pub const STATE_DIR: &str = "/run/cos/state";

pub const PERSISTENT_LABEL: &str = "COS_PERSISTENT";
pub const PERSISTENT_PART_NAME: &str = "persistent";
pub const PERSISTENT_SIZE: u64 = 0;
pub const PERSISTENT_DIR: &str = "/run/cos/persistent";

pub const ACTIVE_LABEL: &str = "COS_ACTIVE";
pub const PASSIVE_LABEL: &str = "COS_PASSIVE";
pub const SYSTEM_LABEL: &str = "COS_SYSTEM";

pub const ACTIVE_DIR: &str = "/run/cos/active";
pub const PASSIVE_DIR: &str = "/run/cos/passive";
pub const TRANSITION_DIR: &str = "/run/cos/transition";
pub const RECOVERY_SQUASH_DIR: &str = "/run/cos/recovery-squash";

/// Where the initramfs mounts the State partition of a running system.
pub const RUNNING_STATE_DIR: &str = "/run/initramfs/cos-state";

/// Live root filesystem of a system booted from a squashfs recovery image.
pub const ISO_BASE_TREE: &str = "/run/rootfsbase";

pub const IMG_DIR: &str = "cOS";
pub const ACTIVE_IMG_FILE: &str = "active.img";
pub const PASSIVE_IMG_FILE: &str = "passive.img";
pub const RECOVERY_IMG_FILE: &str = "recovery.img";
pub const RECOVERY_SQUASH_FILE: &str = "recovery.squashfs";
pub const TRANSITION_IMG_FILE: &str = "transition.img";
pub const TRANSITION_SQUASH_FILE: &str = "transition.squashfs";

pub const IMG_SIZE: u64 = 3072;
pub const LINUX_FS: &str = "ext4";
pub const LINUX_IMG_FS: &str = "ext2";
pub const SQUASH_FS: &str = "squashfs";

pub const GPT: &str = "gpt";
pub const MSDOS: &str = "msdos";

pub const BOOT_FLAG: &str = "boot";
pub const ESP_FLAG: &str = "esp";
pub const BIOS_GRUB_FLAG: &str = "bios_grub";

pub const GRUB_CONF: &str = "/etc/cos/grub.cfg";
pub const GRUB_OEM_ENV: &str = "grub_oem_env";
pub const GRUB_DEFAULT_ENTRY_VAR: &str = "default_menu_entry";

pub const INSTALL_STATE_FILE: &str = "state.toml";
pub const CONFIG_FILE: &str = "config.toml";
pub const CONFIG_DIR: &str = "/etc/cairn";

pub const SELINUX_TARGETED_CONTEXT_FILE: &str = "/etc/selinux/targeted/contexts/files/file_contexts";
pub const SELINUX_TARGETED_POLICY_DIR: &str = "/etc/selinux/targeted/policy";

/// Kernel cmdline key carrying extra stage URIs.
pub const SETUP_CMDLINE_KEY: &str = "cairn.setup";

/// Default paths scanned by the stage runner.
pub const CLOUD_INIT_PATHS: &[&str] = &["/system/oem", "/oem/", "/usr/local/cloud-config/"];

/// Directory skeleton created at the root of every deployed tree.
pub const ROOT_SKELETON: &[&str] = &[
    "sys", "proc", "dev", "tmp", "boot", "usr/local", "oem", "run", "var",
];

/// Offset of the first partition, in bytes.
pub const FIRST_PARTITION_OFFSET: u64 = 1024 * 1024;

/// Mount points bind-mounted into every chroot.
pub const CHROOT_DEFAULT_MOUNTS: &[&str] = &["/dev", "/dev/pts", "/proc", "/sys"];

/// Options passed to `mksquashfs` for the given target architecture.
pub fn squashfs_options(arch: &str) -> Vec<String> {
    let mut opts = vec!["-b", "1024k", "-comp", "xz"];
    match arch {
        "x86_64" => opts.extend(["-Xbcj", "x86"]),
        "aarch64" | "arm64" => opts.extend(["-Xbcj", "arm"]),
        _ => {}
    }
    opts.into_iter().map(String::from).collect()
}

pub fn img_path(mount_point: &Path, file: &str) -> std::path::PathBuf {
    mount_point.join(IMG_DIR).join(file)
}
