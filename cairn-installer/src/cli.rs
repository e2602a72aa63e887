//! Command line of the `cairn` binary.

use cairn_core::constants;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cairn", version)]
#[command(about = "Install, reset and upgrade immutable Linux appliances")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// Directory holding config.toml
    #[arg(long, global = true, default_value = constants::CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install the system on a block device, wiping it
    Install(InstallArgs),
    /// Reset the system to the recovery image (run from recovery only)
    Reset(ResetArgs),
    /// Upgrade the active or recovery image
    Upgrade(UpgradeArgs),
}

/// Options shared by every action.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Reboot when done
    #[arg(long, conflicts_with = "poweroff")]
    pub reboot: bool,

    /// Power off when done
    #[arg(long)]
    pub poweroff: bool,

    /// Fail on hook errors
    #[arg(long)]
    pub strict: bool,

    /// Verify container image signatures
    #[arg(long)]
    pub cosign: bool,

    /// Public key used to verify signatures
    #[arg(long, requires = "cosign")]
    pub cosign_key: Option<String>,

    /// Only use locally available container images
    #[arg(long)]
    pub local: bool,

    /// Extra serial console added to the kernel command line
    #[arg(long)]
    pub tty: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    /// Block device to install to
    pub target: String,

    /// System source URI (dir://, file://, oci://, channel:// or an image reference)
    #[arg(long)]
    pub system: Option<String>,

    /// Recovery system source URI; defaults to a copy of the system
    #[arg(long)]
    pub recovery_system: Option<String>,

    /// Do not partition and format the target
    #[arg(long)]
    pub no_format: bool,

    /// Install even if a deployment already exists
    #[arg(long)]
    pub force: bool,

    /// Install EFI grub regardless of the firmware found
    #[arg(long)]
    pub force_efi: bool,

    /// Use a GPT partition table on BIOS systems
    #[arg(long)]
    pub force_gpt: bool,

    /// Ship the recovery image as squashfs
    #[arg(long)]
    pub squashfs_recovery: bool,

    /// Cloud-init config files or URLs copied to the OEM partition
    #[arg(short = 'c', long = "cloud-init")]
    pub cloud_init: Vec<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ResetArgs {
    /// System source URI; defaults to the running recovery system
    #[arg(long)]
    pub system: Option<String>,

    /// Recovery system source URI; accepted for symmetry, reset leaves recovery untouched
    #[arg(long)]
    pub recovery_system: Option<String>,

    /// Also format the persistent partition
    #[arg(long)]
    pub reset_persistent: bool,

    /// Also format the OEM partition
    #[arg(long)]
    pub reset_oem: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct UpgradeArgs {
    /// System source URI of the new image
    #[arg(long)]
    pub system: Option<String>,

    /// Recovery system source URI; used instead of --system with --recovery
    #[arg(long)]
    pub recovery_system: Option<String>,

    /// Upgrade the recovery image instead of the active one
    #[arg(long)]
    pub recovery: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}
