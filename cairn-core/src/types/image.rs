use super::ImageSource;
use std::path::PathBuf;

/// A deployable filesystem image.
///
/// `size` is in MiB. `loop_device` is only set while the image is mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    pub file: PathBuf,
    pub label: String,
    pub size: u64,
    pub fs: String,
    pub source: ImageSource,
    pub mount_point: PathBuf,
    pub loop_device: Option<String>,
}

impl Image {
    pub fn new(file: impl Into<PathBuf>, label: &str, fs: &str, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            label: label.to_string(),
            size: crate::constants::IMG_SIZE,
            fs: fs.to_string(),
            source: ImageSource::Empty,
            mount_point: mount_point.into(),
            loop_device: None,
        }
    }

    pub fn with_source(mut self, source: ImageSource) -> Self {
        self.source = source;
        self
    }

    pub fn is_squashfs(&self) -> bool {
        self.fs == crate::constants::SQUASH_FS
    }
}
