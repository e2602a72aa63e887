//! Persistent record of what was deployed where.

use crate::constants;
use crate::errors::{ErrorKind, KindContext, Result};
use crate::types::Image;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const HEADER: &str = "# Autogenerated file by cairn, do not edit\n\n";

pub const ACTIVE_IMAGE: &str = "active";
pub const PASSIVE_IMAGE: &str = "passive";
pub const RECOVERY_IMAGE: &str = "recovery";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageState {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_metadata: Option<String>,
    pub label: String,
    pub fs: String,
}

impl ImageState {
    pub fn from_image(img: &Image, source_metadata: Option<String>) -> Self {
        Self {
            source: img.source.to_string(),
            source_metadata,
            label: img.label.clone(),
            fs: img.fs.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionState {
    pub fslabel: String,
    #[serde(default)]
    pub images: BTreeMap<String, ImageState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallState {
    /// Seconds since the unix epoch of the last write.
    pub date: u64,
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionState>,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl InstallState {
    pub fn new() -> Self {
        Self {
            date: now(),
            partitions: BTreeMap::new(),
        }
    }

    /// Record `image` under `partition`, creating the partition entry if needed.
    pub fn set_image(&mut self, partition: &str, fslabel: &str, name: &str, image: ImageState) {
        let part = self.partitions.entry(partition.to_string()).or_default();
        part.fslabel = fslabel.to_string();
        part.images.insert(name.to_string(), image);
    }

    pub fn set_partition(&mut self, partition: &str, fslabel: &str) {
        self.partitions
            .entry(partition.to_string())
            .or_default()
            .fslabel = fslabel.to_string();
    }

    pub fn image(&self, partition: &str, name: &str) -> Option<&ImageState> {
        self.partitions.get(partition)?.images.get(name)
    }

    /// Write the state file into every directory of `dirs`.
    pub fn write_to(&mut self, dirs: &[&Path]) -> Result<()> {
        self.date = now();
        for dir in dirs {
            save_state_atomic(&dir.join(constants::INSTALL_STATE_FILE), self)
                .kind(ErrorKind::WriteState)?;
        }
        Ok(())
    }

    /// Load the state file of the first directory in `dirs` that has one.
    pub fn load_from(dirs: &[&Path]) -> Result<Option<Self>> {
        for dir in dirs {
            if let Some(state) = load_state(&dir.join(constants::INSTALL_STATE_FILE))? {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }
}

pub fn load_state(path: &Path) -> Result<Option<InstallState>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read state file: {}", path.display()))?;
    let state = toml::from_str(&content)
        .with_context(|| format!("failed to parse state file: {}", path.display()))?;
    Ok(Some(state))
}

pub fn save_state_atomic(path: &Path, state: &InstallState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state directory: {}", parent.display()))?;
    }

    let tmp_path = temp_path(path);
    let payload = toml::to_string(state).context("failed to serialize state")?;

    let mut file = File::create(&tmp_path)
        .with_context(|| format!("failed to create temp state file: {}", tmp_path.display()))?;
    file.write_all(HEADER.as_bytes())
        .and_then(|_| file.write_all(payload.as_bytes()))
        .context("failed to write state")?;
    file.sync_all().context("failed to flush state")?;

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace state file: {}", path.display()))?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            dir.sync_all().ok();
        }
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(constants::INSTALL_STATE_FILE);
    path.with_file_name(format!("{file_name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageSource;
    use tempfile::tempdir;

    fn sample() -> InstallState {
        let mut state = InstallState::new();
        let active = Image::new("/run/cos/state/cOS/active.img", "COS_ACTIVE", "ext2", "/run/cos/active")
            .with_source(ImageSource::Docker("registry.org/os:v1".to_string()));
        state.set_image(
            constants::STATE_PART_NAME,
            constants::STATE_LABEL,
            ACTIVE_IMAGE,
            ImageState::from_image(&active, Some("sha256:abcd".to_string())),
        );
        state.set_partition(constants::OEM_PART_NAME, constants::OEM_LABEL);
        state
    }

    #[test]
    fn written_file_has_header_and_loads_back() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let recovery_dir = dir.path().join("recovery");
        let mut state = sample();
        state.write_to(&[&state_dir, &recovery_dir]).unwrap();

        let text = fs::read_to_string(state_dir.join(constants::INSTALL_STATE_FILE)).unwrap();
        assert!(text.starts_with("# Autogenerated file by cairn, do not edit"));
        assert!(text.contains("oci://registry.org/os:v1"));
        assert!(!state_dir.join("state.toml.tmp").exists());

        let loaded = InstallState::load_from(&[&recovery_dir]).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(
            loaded.image("state", ACTIVE_IMAGE).unwrap().source_metadata.as_deref(),
            Some("sha256:abcd")
        );
    }

    #[test]
    fn load_from_skips_dirs_without_state() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty");
        let full = dir.path().join("full");
        sample().write_to(&[&full]).unwrap();
        assert!(InstallState::load_from(&[&empty, &full]).unwrap().is_some());
        assert!(InstallState::load_from(&[&empty]).unwrap().is_none());
    }

    #[test]
    fn unwritable_target_is_write_state_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let e = sample().write_to(&[&blocker]).unwrap_err();
        assert_eq!(crate::errors::kind_of(&e), Some(ErrorKind::WriteState));
    }
}
