//! Turns parsed command lines into lifecycle actions.

use crate::cli::{Cli, Command, CommonArgs, InstallArgs, ResetArgs, UpgradeArgs};
use anyhow::Result;
use cairn_core::config::{Config, ConfigFile, RunConfig};
use cairn_core::constants;
use cairn_core::specs::{InstallSpec, ResetSpec, UpgradeSpec};
use cairn_core::types::{Firmware, ImageSource};
use cairn_hal::SystemHal;
use cairn_workflow::{InstallAction, ResetAction, UpgradeAction};
use std::sync::Arc;

/// Run the action selected by `cli` against `hal`.
pub fn dispatch(cli: Cli, hal: Arc<dyn SystemHal>) -> Result<()> {
    let file = ConfigFile::load(&cli.config_dir)?;
    match cli.command {
        Command::Install(args) => {
            let run = run_config(hal, &file, &args.common)?;
            install(&run, &args)
        }
        Command::Reset(args) => {
            let run = run_config(hal, &file, &args.common)?;
            reset(&run, &args)
        }
        Command::Upgrade(args) => {
            let run = run_config(hal, &file, &args.common)?;
            upgrade(&run, &args)
        }
    }
}

/// Config file values first, command line flags on top.
pub fn run_config(hal: Arc<dyn SystemHal>, file: &ConfigFile, args: &CommonArgs) -> Result<RunConfig> {
    let mut run = RunConfig::new(Config::new(hal)?);
    run.apply_file(file);

    if args.reboot {
        run.reboot = true;
        run.poweroff = false;
    }
    if args.poweroff {
        run.poweroff = true;
        run.reboot = false;
    }
    if args.strict {
        run.config.strict = true;
    }
    if args.local {
        run.config.local_images = true;
    }
    if args.tty.is_some() {
        run.config.tty = args.tty.clone();
    }
    if args.cosign {
        log::warn!("Signature verification is left to the image unpacker");
    }
    Ok(run)
}

fn parse_source(uri: Option<&str>) -> Result<ImageSource> {
    match uri {
        Some(uri) => ImageSource::parse(uri),
        None => Ok(ImageSource::Empty),
    }
}

/// Build the install spec described by `args`.
pub fn install_spec(run: &RunConfig, args: &InstallArgs) -> Result<InstallSpec> {
    let mut spec = InstallSpec::new(&run.config, &args.target);
    if args.force_efi {
        spec.firmware = Firmware::Efi;
    }
    spec.part_table = if spec.firmware == Firmware::Efi || args.force_gpt {
        constants::GPT.to_string()
    } else {
        constants::MSDOS.to_string()
    };
    spec.no_format = args.no_format;
    spec.force = args.force;
    spec.cloud_init = args.cloud_init.clone();
    if args.squashfs_recovery {
        spec.set_squashfs_recovery();
    }
    spec.active.source = parse_source(args.system.as_deref())?;
    if let Some(recovery) = &args.recovery_system {
        spec.recovery.source = ImageSource::parse(recovery)?;
    }
    Ok(spec)
}

pub fn reset_spec(run: &RunConfig, args: &ResetArgs) -> Result<ResetSpec> {
    let mut spec = ResetSpec::new(&run.config)?;
    spec.format_persistent = args.reset_persistent;
    spec.format_oem = args.reset_oem;
    if let Some(system) = &args.system {
        spec.active.source = ImageSource::parse(system)?;
    }
    if args.recovery_system.is_some() {
        log::warn!("Ignoring --recovery-system, reset does not touch the recovery partition");
    }
    Ok(spec)
}

pub fn upgrade_spec(run: &RunConfig, args: &UpgradeArgs) -> Result<UpgradeSpec> {
    let mut spec = UpgradeSpec::new(&run.config)?;
    spec.recovery_upgrade = args.recovery;
    spec.set_source(parse_source(args.system.as_deref())?);
    if let Some(recovery) = &args.recovery_system {
        spec.recovery.source = ImageSource::parse(recovery)?;
    }
    Ok(spec)
}

fn install(run: &RunConfig, args: &InstallArgs) -> Result<()> {
    log::info!("Install called");
    let spec = install_spec(run, args)?;
    InstallAction::new(run, spec).run()
}

fn reset(run: &RunConfig, args: &ResetArgs) -> Result<()> {
    log::info!("Reset called");
    let spec = reset_spec(run, args)?;
    ResetAction::new(run, spec).run()
}

fn upgrade(run: &RunConfig, args: &UpgradeArgs) -> Result<()> {
    log::info!("Upgrade called");
    let spec = upgrade_spec(run, args)?;
    UpgradeAction::new(run, spec).run()
}
