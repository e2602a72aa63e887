//! Filesystem creation (`mkfs.*`).

use crate::errors::{err, ErrorKind, KindContext, Result};
use cairn_hal::ProcessOps;

/// A fully resolved `mkfs` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkfsCall {
    pub program: String,
    pub args: Vec<String>,
}

impl MkfsCall {
    /// Build the command for `fs` on `dev`, labelled `label`.
    ///
    /// ext2/3/4 and xfs take `-L`, vfat takes `-n`. Other filesystems are
    /// rejected before anything runs.
    pub fn new(fs: &str, label: &str, dev: &str, custom_opts: &[String]) -> Result<Self> {
        let label_flag = match fs {
            "ext2" | "ext3" | "ext4" | "xfs" => "-L",
            "vfat" => "-n",
            other => {
                return Err(err(
                    ErrorKind::UnsupportedFilesystem,
                    format!("'{other}' is not supported for formatting"),
                ))
            }
        };
        let mut args = Vec::new();
        if !label.is_empty() {
            args.push(label_flag.to_string());
            args.push(label.to_string());
        }
        args.extend(custom_opts.iter().cloned());
        args.push(dev.to_string());
        Ok(Self {
            program: format!("mkfs.{fs}"),
            args,
        })
    }

    pub fn apply<R: ProcessOps + ?Sized>(&self, runner: &R) -> Result<String> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        runner.run_string(&self.program, &args).kind(ErrorKind::Mkfs)
    }
}

/// Format `dev` with filesystem `fs` and volume label `label`.
pub fn format_device<R: ProcessOps + ?Sized>(
    runner: &R,
    dev: &str,
    fs: &str,
    label: &str,
    opts: &[String],
) -> Result<()> {
    log::info!("Formatting {} as {} ({})", dev, fs, label);
    MkfsCall::new(fs, label, dev, opts)?.apply(runner)?;
    Ok(())
}
