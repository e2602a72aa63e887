//! Bootloader installation and grub environment handling.

use crate::config::Config;
use crate::constants;
use crate::errors::{ErrorKind, KindContext, Result};
use anyhow::Context;
use cairn_hal::HalError;
use std::fs;
use std::path::{Path, PathBuf};

/// Where and how grub gets installed.
#[derive(Debug, Clone)]
pub struct GrubTarget<'p> {
    /// Block device receiving the boot code.
    pub device: &'p str,
    /// Root of the deployed tree, providing the grub modules and config.
    pub root_dir: &'p Path,
    /// Directory receiving the grub directory (the State mount point).
    pub boot_dir: &'p Path,
    /// Mount point of the EFI system partition; `None` installs for BIOS.
    pub efi_dir: Option<&'p Path>,
    /// Serial console to add next to `tty1`.
    pub tty: Option<&'p str>,
}

pub struct Grub<'c> {
    cfg: &'c Config,
}

fn efi_arch(arch: &str) -> &'static str {
    match arch {
        "aarch64" | "arm64" => "arm64",
        _ => "x86_64",
    }
}

/// Add `console=<tty>` after every `console=tty1` of a grub config.
fn with_tty(grub_cfg: &str, tty: Option<&str>) -> String {
    match tty {
        Some(tty) if !tty.is_empty() && tty != "console" && tty != "tty1" => {
            log::info!("Adding extra tty ({}) to grub.cfg", tty);
            grub_cfg.replace("console=tty1", &format!("console=tty1 console={tty}"))
        }
        _ => grub_cfg.to_string(),
    }
}

impl<'c> Grub<'c> {
    pub fn new(cfg: &'c Config) -> Self {
        Self { cfg }
    }

    /// Install grub on `target.device` and copy the config of the deployed tree.
    pub fn install(&self, target: &GrubTarget<'_>) -> Result<()> {
        log::info!("Installing GRUB..");
        let mut args = Vec::new();
        if let Some(efi_dir) = target.efi_dir {
            log::info!("Installing grub efi for arch {}", self.cfg.arch);
            args.push(format!("--target={}-efi", efi_arch(&self.cfg.arch)));
            args.push(format!("--efi-directory={}", efi_dir.display()));
        } else {
            args.push("--target=i386-pc".to_string());
        }
        args.push(format!("--root-directory={}", target.root_dir.display()));
        args.push(format!("--boot-directory={}", target.boot_dir.display()));
        args.push("--removable".to_string());
        args.push(target.device.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let installed = match self.cfg.hal.run("grub2-install", &args) {
            Err(HalError::CommandNotFound(_)) => {
                log::debug!("grub2-install not found, trying grub-install");
                self.cfg.hal.run("grub-install", &args)
            }
            other => other,
        };
        installed.kind(ErrorKind::InstallGrub)?;

        let grub_dir = self.grub_dir(target.boot_dir);
        fs::create_dir_all(&grub_dir)
            .with_context(|| format!("failed to create {}", grub_dir.display()))
            .kind(ErrorKind::InstallGrub)?;

        let source = target
            .root_dir
            .join(constants::GRUB_CONF.trim_start_matches('/'));
        let content = fs::read_to_string(&source)
            .with_context(|| format!("failed to read {}", source.display()))
            .kind(ErrorKind::InstallGrub)?;
        let dest = grub_dir.join("grub.cfg");
        log::info!("Copying grub contents from {} to {}", source.display(), dest.display());
        fs::write(&dest, with_tty(&content, target.tty))
            .with_context(|| format!("failed to write {}", dest.display()))
            .kind(ErrorKind::InstallGrub)?;

        log::info!("Grub install to device {} complete", target.device);
        Ok(())
    }

    /// `grub2` when present, else an existing legacy `grub`, else `grub2`.
    fn grub_dir(&self, boot_dir: &Path) -> PathBuf {
        let grub2 = boot_dir.join("grub2");
        let grub1 = boot_dir.join("grub");
        if !grub2.is_dir() && grub1.is_dir() {
            grub1
        } else {
            grub2
        }
    }

    /// Set `key=value` pairs in the grub environment file `env_file`.
    pub fn set_env(&self, env_file: &Path, vars: &[(&str, &str)]) -> Result<()> {
        let env = env_file.to_string_lossy();
        for (key, value) in vars {
            let pair = format!("{key}={value}");
            self.cfg
                .hal
                .run("grub2-editenv", &[env.as_ref(), "set", pair.as_str()])
                .with_context(|| format!("failed setting grub variable {key}"))?;
        }
        Ok(())
    }

    /// Record the default boot entry in the OEM grub environment of `state_dir`.
    pub fn set_default_entry(&self, state_dir: &Path, entry: &str) -> Result<()> {
        log::info!("Setting default grub entry to {}", entry);
        self.set_env(
            &state_dir.join(constants::GRUB_OEM_ENV),
            &[(constants::GRUB_DEFAULT_ENTRY_VAR, entry)],
        )
        .kind(ErrorKind::SetDefaultGrubEntry)
    }
}
