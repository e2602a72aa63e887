//! Fake HAL implementation for testing.
//!
//! This implementation records all operations without executing them,
//! allowing for CI-safe testing without root privileges or real hardware.
//! Command output can be scripted through [`FakeHal::set_side_effect`].

use super::{
    CopyOps, CopyOptions, HostInfoOps, LoopOps, MountOps, MountOptions, ProcessOps, SyscallOps,
};
use crate::{HalError, HalResult};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Command {
        program: String,
        args: Vec<String>,
    },
    Mount {
        device: PathBuf,
        target: PathBuf,
        fstype: Option<String>,
        options: Vec<String>,
    },
    Unmount {
        target: PathBuf,
    },
    LosetupAttach {
        image: PathBuf,
        loop_device: String,
    },
    LosetupDetach {
        loop_device: String,
    },
    CopyTree {
        src: PathBuf,
        dst: PathBuf,
    },
    Chroot {
        path: PathBuf,
    },
    Chdir {
        path: PathBuf,
    },
    Fchdir,
}

/// Scripted command behaviour: receives the program and its arguments.
pub type SideEffect = Arc<dyn Fn(&str, &[String]) -> HalResult<Vec<u8>> + Send + Sync>;

/// Shared state for FakeHal operations.
#[derive(Default)]
struct FakeHalState {
    /// All operations that were recorded
    operations: Vec<Operation>,
    /// Currently mounted paths
    mounted_paths: HashSet<PathBuf>,
    /// Mount targets that fail when mounted
    failing_mounts: HashSet<PathBuf>,
    /// Unmount targets that fail when unmounted
    failing_unmounts: HashSet<PathBuf>,
    next_loop: u32,
    cmdline: String,
    efi: bool,
    side_effect: Option<SideEffect>,
}

impl fmt::Debug for FakeHalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeHalState")
            .field("operations", &self.operations)
            .field("mounted_paths", &self.mounted_paths)
            .field("cmdline", &self.cmdline)
            .field("efi", &self.efi)
            .finish_non_exhaustive()
    }
}

/// Fake HAL implementation that records operations without executing them.
///
/// This is designed for testing and CI environments where real system
/// operations would fail or be dangerous.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.state.lock().unwrap().operations.iter().any(check)
    }

    /// All recorded commands as `[program, args...]`.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Command { program, args } => {
                    let mut cmd = vec![program.clone()];
                    cmd.extend(args.iter().cloned());
                    Some(cmd)
                }
                _ => None,
            })
            .collect()
    }

    /// Whether any command starting with `program` was run.
    pub fn has_command(&self, program: &str) -> bool {
        self.commands().iter().any(|c| c[0] == program)
    }

    /// Checks the recorded commands against `expected`, in order.
    ///
    /// Each expected command only needs to be a prefix of the recorded one.
    pub fn cmds_match(&self, expected: &[&[&str]]) -> Result<(), String> {
        let cmds = self.commands();
        if cmds.len() != expected.len() {
            return Err(format!(
                "number of calls mismatch, expected {} calls but got {}: {:?}",
                expected.len(),
                cmds.len(),
                cmds
            ));
        }
        for (got, want) in cmds.iter().zip(expected) {
            let matches = want.len() <= got.len()
                && want.iter().zip(got.iter()).all(|(w, g)| *w == g.as_str());
            if !matches {
                return Err(format!("expected command {:?}, got {:?}", want, got));
            }
        }
        Ok(())
    }

    /// Clear all recorded operations and mounts.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.operations.clear();
        state.mounted_paths.clear();
    }

    /// Script command results.
    pub fn set_side_effect<F>(&self, f: F)
    where
        F: Fn(&str, &[String]) -> HalResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.state.lock().unwrap().side_effect = Some(Arc::new(f));
    }

    /// Every command returns `out`.
    pub fn set_return_value(&self, out: &[u8]) {
        let out = out.to_vec();
        self.set_side_effect(move |_, _| Ok(out.clone()));
    }

    pub fn set_cmdline(&self, cmdline: &str) {
        self.state.lock().unwrap().cmdline = cmdline.to_string();
    }

    pub fn set_efi(&self, efi: bool) {
        self.state.lock().unwrap().efi = efi;
    }

    /// Make any later mount onto `target` fail.
    pub fn fail_mount(&self, target: impl Into<PathBuf>) {
        self.state.lock().unwrap().failing_mounts.insert(target.into());
    }

    /// Make any later unmount of `target` fail.
    pub fn fail_unmount(&self, target: impl Into<PathBuf>) {
        self.state.lock().unwrap().failing_unmounts.insert(target.into());
    }

    /// Pretend `target` is already mounted.
    pub fn add_mounted(&self, target: impl Into<PathBuf>) {
        self.state.lock().unwrap().mounted_paths.insert(target.into());
    }

    pub fn mounted_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .state
            .lock()
            .unwrap()
            .mounted_paths
            .iter()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    fn record_operation(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }
}

impl ProcessOps for FakeHal {
    fn command_output_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        _cwd: Option<&Path>,
        _timeout: Duration,
    ) -> HalResult<Output> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.record_operation(Operation::Command {
            program: program.to_string(),
            args: args.clone(),
        });

        // Clone the closure out so it may call back into the fake.
        let side_effect = self.state.lock().unwrap().side_effect.clone();
        let stdout = match side_effect {
            Some(f) => f(program, &args)?,
            None => Vec::new(),
        };

        Ok(Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout,
            stderr: Vec::new(),
        })
    }
}

impl MountOps for FakeHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &MountOptions,
    ) -> HalResult<()> {
        log::info!(
            "FAKE HAL: mount {} -> {} (type: {:?})",
            device.display(),
            target.display(),
            fstype
        );

        self.record_operation(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.map(String::from),
            options: options.options.clone(),
        });

        let mut state = self.state.lock().unwrap();
        if state.failing_mounts.contains(target) {
            return Err(HalError::Other(format!(
                "mount {} failed",
                target.display()
            )));
        }
        state.mounted_paths.insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        log::info!("FAKE HAL: unmount {}", target.display());

        self.record_operation(Operation::Unmount {
            target: target.to_path_buf(),
        });

        let mut state = self.state.lock().unwrap();
        if state.failing_unmounts.contains(target) {
            return Err(HalError::DeviceBusy(target.display().to_string()));
        }
        state.mounted_paths.remove(target);
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        Ok(self.state.lock().unwrap().mounted_paths.contains(path))
    }
}

impl LoopOps for FakeHal {
    fn losetup_attach(&self, image: &Path) -> HalResult<String> {
        let loop_device = {
            let mut state = self.state.lock().unwrap();
            let dev = format!("/dev/loop{}", state.next_loop);
            state.next_loop += 1;
            dev
        };
        self.record_operation(Operation::LosetupAttach {
            image: image.to_path_buf(),
            loop_device: loop_device.clone(),
        });
        Ok(loop_device)
    }

    fn losetup_detach(&self, loop_device: &str) -> HalResult<()> {
        self.record_operation(Operation::LosetupDetach {
            loop_device: loop_device.to_string(),
        });
        Ok(())
    }
}

impl CopyOps for FakeHal {
    fn copy_tree(&self, src: &Path, dst: &Path, _opts: &CopyOptions) -> HalResult<()> {
        self.record_operation(Operation::CopyTree {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        Ok(())
    }
}

impl SyscallOps for FakeHal {
    fn chroot(&self, path: &Path) -> HalResult<()> {
        self.record_operation(Operation::Chroot {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn chdir(&self, path: &Path) -> HalResult<()> {
        self.record_operation(Operation::Chdir {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn fchdir(&self, _dir: &File) -> HalResult<()> {
        self.record_operation(Operation::Fchdir);
        Ok(())
    }
}

impl HostInfoOps for FakeHal {
    fn proc_cmdline(&self) -> HalResult<String> {
        Ok(self.state.lock().unwrap().cmdline.clone())
    }

    fn efi_firmware(&self) -> bool {
        self.state.lock().unwrap().efi
    }
}
