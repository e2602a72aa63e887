//! Materialization of container and package-channel references.

use crate::errors::{ErrorKind, KindContext, Result};
use cairn_hal::SystemHal;
use std::path::Path;
use std::sync::Arc;

/// Unpacks content references into a target directory.
pub trait Unpacker: Send + Sync {
    /// Unpack container image `reference` into `target`.
    ///
    /// With `local` set, only locally available images are considered.
    /// Returns the image digest when the backend reports one.
    fn unpack(&self, target: &Path, reference: &str, local: bool) -> Result<Option<String>>;

    /// Install package-channel `reference` with `target` as system root.
    fn unpack_channel(&self, target: &Path, reference: &str) -> Result<Option<String>>;
}

/// [`Unpacker`] backed by the `luet` CLI.
pub struct LuetUnpacker {
    hal: Arc<dyn SystemHal>,
}

impl LuetUnpacker {
    pub fn new(hal: Arc<dyn SystemHal>) -> Self {
        Self { hal }
    }
}

/// Extract `sha256:...` from a `Digest:` line of the unpack output.
fn parse_digest(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("Digest:")?;
        let digest = rest.trim();
        (!digest.is_empty()).then(|| digest.to_string())
    })
}

impl Unpacker for LuetUnpacker {
    fn unpack(&self, target: &Path, reference: &str, local: bool) -> Result<Option<String>> {
        log::info!("Unpacking {} into {}", reference, target.display());
        let target = target.to_string_lossy();
        let mut args = vec!["util", "unpack"];
        if local {
            args.push("--local");
        }
        args.push(reference);
        args.push(target.as_ref());
        let out = self.hal.run_string("luet", &args).kind(ErrorKind::DumpSource)?;
        Ok(parse_digest(&out))
    }

    fn unpack_channel(&self, target: &Path, reference: &str) -> Result<Option<String>> {
        log::info!("Installing {} into {}", reference, target.display());
        let target = target.to_string_lossy();
        self.hal
            .run("luet", &["install", "-y", "--system-target", target.as_ref(), reference])
            .kind(ErrorKind::DumpSource)?;
        Ok(None)
    }
}
