//! Linux HAL implementation using real system calls.

use super::{
    CopyOps, CopyOptions, HostInfoOps, LoopOps, MountOps, MountOptions, ProcessOps, SyscallOps,
};
use crate::{HalError, HalResult};
use std::fs;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

const LOSETUP_TIMEOUT: Duration = Duration::from_secs(30);
const RSYNC_MAX_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
const EFI_FIRMWARE_DIR: &str = "/sys/firmware/efi";

fn map_command_err(program: &str, err: std::io::Error) -> HalError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return HalError::CommandNotFound(program.to_string());
    }
    HalError::Io(err)
}

fn output_failed(program: &str, output: &Output) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn output_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| map_command_err(program, e))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    // Drain pipes concurrently to avoid deadlocks on large output.
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr.take() {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let status = match child.wait_timeout(timeout).map_err(HalError::Io)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            return Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

fn map_nix_err(target: &Path, err: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    match err {
        Errno::EBUSY => HalError::DeviceBusy(target.display().to_string()),
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

impl ProcessOps for LinuxHal {
    fn command_output_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        output_with_timeout(program, &mut cmd, timeout)
    }
}

impl MountOps for LinuxHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: &MountOptions,
    ) -> HalResult<()> {
        let (flags, data) = options.to_flags_and_data();
        log::debug!(
            "mount {} -> {} (type: {:?}, options: {:?})",
            device.display(),
            target.display(),
            fstype,
            options.options
        );

        // Bind mounts and remounts ignore the filesystem type.
        let fstype = if flags.intersects(nix::mount::MsFlags::MS_BIND | nix::mount::MsFlags::MS_REMOUNT)
        {
            None
        } else {
            fstype.filter(|t| !t.is_empty() && *t != "auto")
        };

        nix::mount::mount(Some(device), target, fstype, flags, data.as_deref())
            .map_err(|e| map_nix_err(target, e))?;

        Ok(())
    }

    fn unmount(&self, target: &Path) -> HalResult<()> {
        log::debug!("umount {}", target.display());
        nix::mount::umount2(target, nix::mount::MntFlags::empty())
            .map_err(|e| map_nix_err(target, e))?;
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        let content = fs::read_to_string("/proc/self/mountinfo")?;
        let entries = crate::procfs::mountinfo::parse_mountinfo(&content);
        Ok(crate::procfs::mountinfo::is_mounted_from_info(
            path, &entries,
        ))
    }
}

impl LoopOps for LinuxHal {
    fn losetup_attach(&self, image: &Path) -> HalResult<String> {
        let mut cmd = Command::new("losetup");
        cmd.args(["--show", "-f"]).arg(image);
        let output = output_with_timeout("losetup", &mut cmd, LOSETUP_TIMEOUT)?;

        if !output.status.success() {
            return Err(output_failed("losetup", &output));
        }

        let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if device.is_empty() {
            return Err(HalError::Parse(format!(
                "losetup returned no device for {}",
                image.display()
            )));
        }
        Ok(device)
    }

    fn losetup_detach(&self, loop_device: &str) -> HalResult<()> {
        let mut cmd = Command::new("losetup");
        cmd.args(["-d", loop_device]);
        let output = output_with_timeout("losetup", &mut cmd, LOSETUP_TIMEOUT)?;
        if !output.status.success() {
            return Err(output_failed("losetup", &output));
        }
        Ok(())
    }
}

impl CopyOps for LinuxHal {
    fn copy_tree(&self, src: &Path, dst: &Path, opts: &CopyOptions) -> HalResult<()> {
        let mut args: Vec<String> = vec!["-aHAX".to_string(), "--numeric-ids".to_string()];
        for exclude in &opts.excludes {
            args.push(format!("--exclude=/{}", exclude.trim_start_matches('/')));
        }

        // Trailing slash on src copies its contents rather than the directory itself.
        args.push(format!("{}/", src.display()));
        args.push(dst.display().to_string());

        let mut cmd = Command::new("rsync");
        cmd.args(&args);
        let output = output_with_timeout("rsync", &mut cmd, RSYNC_MAX_TIMEOUT)?;
        if !output.status.success() {
            return Err(output_failed("rsync", &output));
        }
        Ok(())
    }
}

impl SyscallOps for LinuxHal {
    fn chroot(&self, path: &Path) -> HalResult<()> {
        nix::unistd::chroot(path).map_err(|e| map_nix_err(path, e))
    }

    fn chdir(&self, path: &Path) -> HalResult<()> {
        nix::unistd::chdir(path).map_err(|e| map_nix_err(path, e))
    }

    fn fchdir(&self, dir: &fs::File) -> HalResult<()> {
        nix::unistd::fchdir(dir.as_raw_fd()).map_err(HalError::Nix)
    }
}

impl HostInfoOps for LinuxHal {
    fn proc_cmdline(&self) -> HalResult<String> {
        Ok(fs::read_to_string("/proc/cmdline")?)
    }

    fn efi_firmware(&self) -> bool {
        Path::new(EFI_FIRMWARE_DIR).exists()
    }
}
