use std::fmt;
use std::io;
use thiserror::Error;

pub type HalResult<T> = Result<T, HalError>;
pub type CairnResult<T> = Result<T, CairnError>;

/// Errors raised by the hardware abstraction layer (processes, mounts, loop devices).
#[derive(Error, Debug)]
pub enum HalError {
    #[error("Device is busy (mounted or in use): {0}")]
    DeviceBusy(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command failed: {program} (exit={code:?}): {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out: {program} after {timeout_secs}s")]
    CommandTimeout { program: String, timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("nix errno: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("UTF-8 decode error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Classification of lifecycle failures.
///
/// Step kinds (`MountPartitions`, `DeployImage`, ...) name the orchestrator
/// step that failed and map to a stable process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // preconditions
    ResetNotFromRecovery,
    AlreadyInstalled,
    MissingPartition,
    InvalidFlags,
    InvalidLayout,
    InvalidTarget,
    ChrootAlreadyPrepared,

    // parse / format
    Parse,
    UnsupportedFilesystem,
    InvalidPartitionTable,
    UnsupportedSource,

    // transient absence
    PartitionDeviceNotFound,
    DeviceNotFound,

    // disk layout mutations
    NotEnoughSpace,
    CannotShrink,
    NoPartitions,

    // orchestrator steps
    CommandRun,
    CopyFile,
    CreateDir,
    CreateFile,
    DumpSource,
    Mkfs,
    TruncateFile,
    MountStatePartition,
    MountRecoveryPartition,
    MountPartitions,
    UnmountPartitions,
    FormatPartitions,
    PartitioningDevice,
    DeployImage,
    UnmountImage,
    LabelImage,
    MoveFile,
    InstallGrub,
    SetDefaultGrubEntry,
    SelinuxRelabel,
    DownloadFile,
    WriteState,
    Hook,
    Cleanup,
    Reboot,
    PowerOff,

    Unknown,
}

impl ErrorKind {
    /// Human readable summary used when no detail is attached.
    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::ResetNotFromRecovery => "reset can only be called from the recovery system",
            ErrorKind::AlreadyInstalled => {
                "use `force` flag to run an installation over the current running deployment"
            }
            ErrorKind::MissingPartition => "required partition not found",
            ErrorKind::InvalidFlags => "invalid flag combination",
            ErrorKind::InvalidLayout => "invalid partition layout",
            ErrorKind::InvalidTarget => "invalid target device",
            ErrorKind::ChrootAlreadyPrepared => {
                "there are already active mountpoints for this chroot instance"
            }
            ErrorKind::Parse => "failed to parse tool output",
            ErrorKind::UnsupportedFilesystem => "unsupported filesystem",
            ErrorKind::InvalidPartitionTable => "invalid partition table type",
            ErrorKind::UnsupportedSource => "unsupported image source",
            ErrorKind::PartitionDeviceNotFound => "could not find partition device",
            ErrorKind::DeviceNotFound => "device not found",
            ErrorKind::NotEnoughSpace => "not enough free space",
            ErrorKind::CannotShrink => "cannot shrink partition",
            ErrorKind::NoPartitions => "there is no partition to expand",
            ErrorKind::CommandRun => "command failed",
            ErrorKind::CopyFile => "failed copying file",
            ErrorKind::CreateDir => "failed creating directory",
            ErrorKind::CreateFile => "failed creating file",
            ErrorKind::DumpSource => "failed dumping image source",
            ErrorKind::Mkfs => "failed creating filesystem",
            ErrorKind::TruncateFile => "failed truncating file",
            ErrorKind::MountStatePartition => "failed mounting state partition",
            ErrorKind::MountRecoveryPartition => "failed mounting recovery partition",
            ErrorKind::MountPartitions => "failed mounting partitions",
            ErrorKind::UnmountPartitions => "failed unmounting partitions",
            ErrorKind::FormatPartitions => "failed formatting partitions",
            ErrorKind::PartitioningDevice => "failed partitioning device",
            ErrorKind::DeployImage => "failed deploying image",
            ErrorKind::UnmountImage => "failed unmounting image",
            ErrorKind::LabelImage => "failed labeling image",
            ErrorKind::MoveFile => "failed moving file",
            ErrorKind::InstallGrub => "failed installing grub",
            ErrorKind::SetDefaultGrubEntry => "failed setting default grub entry",
            ErrorKind::SelinuxRelabel => "failed relabelling filesystem",
            ErrorKind::DownloadFile => "failed downloading file",
            ErrorKind::WriteState => "failed writing install state",
            ErrorKind::Hook => "hook failed",
            ErrorKind::Cleanup => "cleanup failed",
            ErrorKind::Reboot => "failed rebooting",
            ErrorKind::PowerOff => "failed powering off",
            ErrorKind::Unknown => "unknown error",
        }
    }

    /// Process exit code reported by the CLI when this kind aborts a run.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::CommandRun => 11,
            ErrorKind::CopyFile => 13,
            ErrorKind::InvalidFlags => 14,
            ErrorKind::CreateDir => 15,
            ErrorKind::CreateFile => 16,
            ErrorKind::DumpSource => 18,
            ErrorKind::UnsupportedSource => 20,
            ErrorKind::Mkfs | ErrorKind::UnsupportedFilesystem => 21,
            ErrorKind::TruncateFile => 30,
            ErrorKind::MountStatePartition => 34,
            ErrorKind::MountRecoveryPartition => 35,
            ErrorKind::MoveFile => 40,
            ErrorKind::Cleanup => 41,
            ErrorKind::Reboot => 42,
            ErrorKind::PowerOff => 43,
            ErrorKind::LabelImage | ErrorKind::UnmountImage => 44,
            ErrorKind::SetDefaultGrubEntry => 45,
            ErrorKind::SelinuxRelabel => 46,
            ErrorKind::InvalidTarget | ErrorKind::DeviceNotFound => 47,
            ErrorKind::DeployImage => 48,
            ErrorKind::InstallGrub => 49,
            ErrorKind::Hook => 50,
            ErrorKind::DownloadFile => 53,
            ErrorKind::MountPartitions => 54,
            ErrorKind::PartitioningDevice
            | ErrorKind::InvalidPartitionTable
            | ErrorKind::InvalidLayout
            | ErrorKind::NotEnoughSpace
            | ErrorKind::CannotShrink
            | ErrorKind::NoPartitions
            | ErrorKind::PartitionDeviceNotFound
            | ErrorKind::Parse => 56,
            ErrorKind::AlreadyInstalled => 57,
            ErrorKind::UnmountPartitions => 59,
            ErrorKind::FormatPartitions => 60,
            ErrorKind::ResetNotFromRecovery | ErrorKind::MissingPartition => 61,
            ErrorKind::ChrootAlreadyPrepared => 62,
            ErrorKind::WriteState => 64,
            ErrorKind::Unknown => 255,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A lifecycle error: a kind plus an optional detail string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CairnError {
    pub kind: ErrorKind,
    pub detail: Option<String>,
}

impl CairnError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

impl fmt::Display for CairnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind, detail),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for CairnError {}

impl From<ErrorKind> for CairnError {
    fn from(kind: ErrorKind) -> Self {
        CairnError::new(kind)
    }
}

/// Returns the kind of the outermost `CairnError` found in an error chain.
pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
    if let Some(e) = err.downcast_ref::<CairnError>() {
        return Some(e.kind);
    }
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CairnError>())
        .map(|e| e.kind)
}

/// Exit code for an error chain; 1 when no kind is attached.
pub fn exit_code_of(err: &anyhow::Error) -> i32 {
    kind_of(err).map(ErrorKind::exit_code).unwrap_or(1)
}

/// Attaches an `ErrorKind` to any result, keeping the original error as the source.
pub trait KindContext<T> {
    fn kind(self, kind: ErrorKind) -> anyhow::Result<T>;
}

impl<T, E> KindContext<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn kind(self, kind: ErrorKind) -> anyhow::Result<T> {
        self.map_err(|e| e.into().context(CairnError::new(kind)))
    }
}
