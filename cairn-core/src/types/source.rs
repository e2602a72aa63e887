use crate::errors::{err, ErrorKind, Result};
use std::fmt;
use std::path::PathBuf;

/// Where the content of an image comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ImageSource {
    #[default]
    Empty,
    File(PathBuf),
    Dir(PathBuf),
    /// Container image reference, e.g. `registry.example.org/os:v1`.
    Docker(String),
    /// Package channel reference, e.g. `system/cos`.
    Channel(String),
}

impl ImageSource {
    /// Parse a source URI.
    ///
    /// Accepted schemes: `dir://`, `file://`, `docker://`, `oci://`,
    /// `channel://`. A value without scheme is taken as a container reference.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Ok(ImageSource::Empty);
        }
        let Some((scheme, rest)) = uri.split_once("://") else {
            return Ok(ImageSource::Docker(uri.to_string()));
        };
        if rest.is_empty() {
            return Err(err(
                ErrorKind::UnsupportedSource,
                format!("empty reference in '{uri}'"),
            ));
        }
        match scheme {
            "dir" => Ok(ImageSource::Dir(PathBuf::from(rest))),
            "file" => Ok(ImageSource::File(PathBuf::from(rest))),
            "docker" | "oci" => Ok(ImageSource::Docker(rest.to_string())),
            "channel" => Ok(ImageSource::Channel(rest.to_string())),
            other => Err(err(
                ErrorKind::UnsupportedSource,
                format!("unknown scheme '{other}' in '{uri}'"),
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ImageSource::Empty)
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ImageSource::File(_))
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Empty => Ok(()),
            ImageSource::File(p) => write!(f, "file://{}", p.display()),
            ImageSource::Dir(p) => write!(f, "dir://{}", p.display()),
            ImageSource::Docker(r) => write!(f, "oci://{r}"),
            ImageSource::Channel(r) => write!(f, "channel://{r}"),
        }
    }
}
