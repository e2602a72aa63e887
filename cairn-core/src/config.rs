//! Runtime configuration shared by every lifecycle action.

use crate::constants;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::hooks::{StageRunner, YipStageRunner};
use crate::types::Firmware;
use crate::unpack::{LuetUnpacker, Unpacker};
use anyhow::{Context, Result};
use cairn_hal::SystemHal;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Capabilities and settings passed explicitly to every action.
#[derive(Clone)]
pub struct Config {
    pub hal: Arc<dyn SystemHal>,
    pub stage_runner: Arc<dyn StageRunner>,
    pub unpacker: Arc<dyn Unpacker>,
    pub fetcher: Arc<dyn Fetcher>,
    pub arch: String,
    pub firmware: Firmware,
    /// Fail on hook errors instead of logging them.
    pub strict: bool,
    /// Extra stage paths, appended to the defaults.
    pub cloud_init_paths: Vec<String>,
    /// Only consider locally available container images.
    pub local_images: bool,
    pub tty: Option<String>,
    pub grub_default_entry: Option<String>,
}

impl Config {
    /// Build a config with the default collaborators on top of `hal`.
    pub fn new(hal: Arc<dyn SystemHal>) -> Result<Self> {
        let firmware = if hal.efi_firmware() {
            Firmware::Efi
        } else {
            Firmware::Bios
        };
        Ok(Self {
            stage_runner: Arc::new(YipStageRunner::new(hal.clone())),
            unpacker: Arc::new(LuetUnpacker::new(hal.clone())),
            fetcher: Arc::new(HttpFetcher::new(hal.clone())?),
            hal,
            arch: std::env::consts::ARCH.to_string(),
            firmware,
            strict: false,
            cloud_init_paths: Vec::new(),
            local_images: false,
            tty: None,
            grub_default_entry: None,
        })
    }

    pub fn with_stage_runner(mut self, runner: Arc<dyn StageRunner>) -> Self {
        self.stage_runner = runner;
        self
    }

    pub fn with_unpacker(mut self, unpacker: Arc<dyn Unpacker>) -> Self {
        self.unpacker = unpacker;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_firmware(mut self, firmware: Firmware) -> Self {
        self.firmware = firmware;
        self
    }

    /// Default stage paths followed by the configured extra ones.
    pub fn stage_paths(&self) -> Vec<String> {
        constants::CLOUD_INIT_PATHS
            .iter()
            .map(|p| p.to_string())
            .chain(self.cloud_init_paths.iter().cloned())
            .collect()
    }

    /// Apply values from a config file; unset values keep the current ones.
    pub fn apply_file(&mut self, file: &ConfigFile) {
        if let Some(strict) = file.strict {
            self.strict = strict;
        }
        self.cloud_init_paths
            .extend(file.cloud_init_paths.iter().cloned());
        if file.tty.is_some() {
            self.tty = file.tty.clone();
        }
        if file.grub_default_entry.is_some() {
            self.grub_default_entry = file.grub_default_entry.clone();
        }
        if let Some(arch) = &file.arch {
            self.arch = arch.clone();
        }
    }
}

/// A config plus what to do once the action finishes.
#[derive(Clone)]
pub struct RunConfig {
    pub config: Config,
    pub reboot: bool,
    pub poweroff: bool,
    /// Wait before rebooting or powering off.
    pub power_delay: Duration,
}

impl RunConfig {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            reboot: false,
            poweroff: false,
            power_delay: Duration::from_secs(5),
        }
    }

    /// Apply the power defaults of a config file.
    pub fn apply_file(&mut self, file: &ConfigFile) {
        self.config.apply_file(file);
        if let Some(reboot) = file.reboot {
            self.reboot = reboot;
        }
        if let Some(poweroff) = file.poweroff {
            self.poweroff = poweroff;
        }
    }
}

/// On-disk settings read from `<config-dir>/config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub strict: Option<bool>,
    #[serde(default)]
    pub cloud_init_paths: Vec<String>,
    #[serde(default)]
    pub reboot: Option<bool>,
    #[serde(default)]
    pub poweroff: Option<bool>,
    #[serde(default)]
    pub tty: Option<String>,
    #[serde(default)]
    pub grub_default_entry: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse config file")
    }

    /// Load `config.toml` from `dir`. A missing file yields the defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(constants::CONFIG_FILE);
        if !path.exists() {
            log::debug!("no config file at {}", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_hal::FakeHal;
    use tempfile::tempdir;

    #[test]
    fn config_file_uses_kebab_case_keys() {
        let file = ConfigFile::parse(
            r#"
strict = true
cloud-init-paths = ["/etc/extra"]
reboot = true
grub-default-entry = "cOS"
"#,
        )
        .unwrap();
        assert_eq!(file.strict, Some(true));
        assert_eq!(file.cloud_init_paths, vec!["/etc/extra".to_string()]);
        assert_eq!(file.reboot, Some(true));
        assert_eq!(file.poweroff, None);
        assert_eq!(file.grub_default_entry.as_deref(), Some("cOS"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(ConfigFile::parse("stritc = true\n").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        assert_eq!(ConfigFile::load(dir.path()).unwrap(), ConfigFile::default());
    }

    #[test]
    fn file_values_are_applied() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(constants::CONFIG_FILE),
            "strict = true\ntty = \"ttyS0\"\ncloud-init-paths = [\"/x\"]\n",
        )
        .unwrap();
        let file = ConfigFile::load(dir.path()).unwrap();

        let hal = FakeHal::new();
        hal.set_efi(true);
        let mut cfg = Config::new(Arc::new(hal)).unwrap();
        assert_eq!(cfg.firmware, Firmware::Efi);
        cfg.apply_file(&file);

        assert!(cfg.strict);
        assert_eq!(cfg.tty.as_deref(), Some("ttyS0"));
        assert_eq!(cfg.stage_paths().last().map(String::as_str), Some("/x"));
        assert_eq!(cfg.stage_paths().len(), constants::CLOUD_INIT_PATHS.len() + 1);
    }
}
