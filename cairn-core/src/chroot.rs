//! Run commands inside a deployed root tree.

use crate::constants;
use crate::errors::{err, ErrorKind, Result};
use anyhow::Context;
use cairn_hal::{MountOptions, SystemHal};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub struct Chroot<'a, H: SystemHal + ?Sized> {
    path: PathBuf,
    hal: &'a H,
    default_mounts: Vec<String>,
    /// Host source -> path inside the chroot.
    extra_mounts: BTreeMap<PathBuf, PathBuf>,
    active_mounts: Vec<PathBuf>,
}

impl<'a, H: SystemHal + ?Sized> Chroot<'a, H> {
    pub fn new(path: impl Into<PathBuf>, hal: &'a H) -> Self {
        Self {
            path: path.into(),
            hal,
            default_mounts: constants::CHROOT_DEFAULT_MOUNTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra_mounts: BTreeMap::new(),
            active_mounts: Vec::new(),
        }
    }

    /// Bind-mount `source` from the host at `target` inside the chroot.
    pub fn add_extra_mount(&mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        self.extra_mounts.insert(source.into(), target.into());
    }

    pub fn set_extra_mounts(&mut self, mounts: BTreeMap<PathBuf, PathBuf>) {
        self.extra_mounts = mounts;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_prepared(&self) -> bool {
        !self.active_mounts.is_empty()
    }

    fn inner_path(&self, mount_point: &Path) -> PathBuf {
        self.path
            .join(mount_point.strip_prefix("/").unwrap_or(mount_point))
    }

    fn bind(&mut self, source: &Path, target: PathBuf) -> Result<()> {
        fs::create_dir_all(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        self.hal
            .mount_device(source, &target, None, &MountOptions::bind())
            .with_context(|| {
                format!(
                    "failed to bind-mount {} at {}",
                    source.display(),
                    target.display()
                )
            })?;
        self.active_mounts.push(target);
        Ok(())
    }

    /// Bind-mount the kernel filesystems and the extra mounts.
    ///
    /// Fails if this chroot is already prepared.
    pub fn prepare(&mut self) -> Result<()> {
        if self.is_prepared() {
            return Err(err(
                ErrorKind::ChrootAlreadyPrepared,
                self.path.display().to_string(),
            ));
        }

        let mut binds: Vec<(PathBuf, PathBuf)> = self
            .default_mounts
            .iter()
            .map(|m| (PathBuf::from(m), self.inner_path(Path::new(m))))
            .collect();

        let mut extras: Vec<(&PathBuf, &PathBuf)> = self.extra_mounts.iter().collect();
        extras.sort_by(|a, b| a.1.cmp(b.1));
        binds.extend(
            extras
                .into_iter()
                .map(|(source, target)| (source.clone(), self.inner_path(target))),
        );

        for (source, target) in binds {
            if let Err(e) = self.bind(&source, target) {
                // Do not leak the mounts made so far.
                if let Err(close_err) = self.close() {
                    log::warn!("failed to release chroot mounts: {:#}", close_err);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmount everything `prepare` mounted, deepest first.
    ///
    /// Stops at the first failure; mounts not yet released stay tracked.
    pub fn close(&mut self) -> Result<()> {
        while let Some(target) = self.active_mounts.last().cloned() {
            self.hal
                .unmount(&target)
                .with_context(|| format!("failed to unmount {}", target.display()))?;
            self.active_mounts.pop();
        }
        Ok(())
    }

    /// Run `f` with the process root switched into this chroot.
    ///
    /// Mounts are prepared (and closed again) when not already in place. The
    /// real root is restored even when `f` fails.
    pub fn run_callback<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        let old_root = fs::File::open("/").context("failed to open current root")?;

        let prepared_here = !self.is_prepared();
        if prepared_here {
            self.prepare()?;
        }

        let result = self.enter_and_run(&old_root, &cwd, f);

        if prepared_here {
            let closed = self.close();
            return match (result, closed) {
                (Ok(v), Ok(())) => Ok(v),
                (Ok(_), Err(e)) => Err(e),
                (Err(e), Ok(())) => Err(e),
                (Err(e), Err(close_err)) => {
                    log::warn!("failed closing chroot: {:#}", close_err);
                    Err(e)
                }
            };
        }
        result
    }

    fn enter_and_run<T, F>(&self, old_root: &fs::File, cwd: &Path, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.hal
            .chroot(&self.path)
            .with_context(|| format!("failed to chroot into {}", self.path.display()))?;

        let result = match self.hal.chdir(Path::new("/")) {
            Ok(()) => f(),
            Err(e) => Err(anyhow::Error::new(e).context("failed to chdir into chroot")),
        };

        let restored = self
            .hal
            .fchdir(old_root)
            .and_then(|_| self.hal.chroot(Path::new(".")))
            .and_then(|_| self.hal.chdir(cwd))
            .context("failed to restore original root");

        match (result, restored) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(restore_err)) => {
                log::error!("{:#}", restore_err);
                Err(e)
            }
        }
    }

    /// Run `command args...` inside the chroot and return its stdout.
    pub fn run(&mut self, command: &str, args: &[&str]) -> Result<String> {
        let hal = self.hal;
        self.run_callback(|| {
            hal.run_string(command, args)
                .with_context(|| format!("'{}' failed in chroot", command))
        })
    }
}
