//! Process execution helpers.
//!
//! External commands are "world-touching" and must go through the HAL so the
//! partitioner and the lifecycle actions can be tested without spawning real
//! processes.

use crate::{HalError, HalResult};
use std::path::Path;
use std::process::Output;
use std::time::Duration;

/// Timeout applied by [`ProcessOps::run`].
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Process execution trait (external command runner).
pub trait ProcessOps {
    fn command_output_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<Output>;

    fn command_output(&self, program: &str, args: &[&str], timeout: Duration) -> HalResult<Output> {
        self.command_output_with_cwd(program, args, None, timeout)
    }

    /// Run a command to completion and return its stdout.
    ///
    /// A non-zero exit status is reported as [`HalError::CommandFailed`]
    /// carrying the trimmed stderr.
    fn run(&self, program: &str, args: &[&str]) -> HalResult<Vec<u8>> {
        log::debug!("Running cmd: '{} {}'", program, args.join(" "));
        let output = self.command_output(program, args, DEFAULT_COMMAND_TIMEOUT)?;
        if !output.status.success() {
            return Err(HalError::CommandFailed {
                program: program.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Like [`ProcessOps::run`] but decodes stdout lossily into a `String`.
    fn run_string(&self, program: &str, args: &[&str]) -> HalResult<String> {
        let out = self.run(program, args)?;
        Ok(String::from_utf8_lossy(&out).to_string())
    }
}
