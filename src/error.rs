//! Error taxonomy for a launch.
//!
//! Every failure falls into one of three buckets: the configuration was
//! rejected before anything touched the system, a setup operation failed
//! with an errno, or the final `execve` failed. The first error aborts the
//! launch; nothing is rolled back because every mount lives in a namespace
//! that disappears with the process.

use nix::errno::Errno;
use std::{ffi::OsStr, io, path::PathBuf};
use thiserror::Error;

/// Longest accepted bind source or destination, in bytes (`PATH_MAX`).
pub const PATH_LIMIT: usize = 4096;

/// Longest accepted `NAME=VALUE` assignment, in bytes.
pub const ENV_ASSIGNMENT_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("root directory {0} does not exist")]
    RootMissing(PathBuf),

    #[error("root directory {0} is not a directory")]
    RootNotDirectory(PathBuf),

    #[error("working directory {0} must be an absolute path")]
    RelativeWorkingDir(PathBuf),

    #[error("cannot determine the invocation directory: {0}")]
    InvocationDir(#[source] io::Error),

    #[error("invalid bind spec {spec:?}: {reason}")]
    InvalidBind { spec: String, reason: &'static str },

    #[error("bind path is {len} bytes, limit is {}", PATH_LIMIT - 1)]
    BindPathTooLong { len: usize },

    #[error("bind destination {0} resolves outside the root directory")]
    DestinationEscapesRoot(PathBuf),

    #[error("invalid environment assignment {assignment:?}: {reason}")]
    InvalidEnv {
        assignment: String,
        reason: &'static str,
    },

    #[error("environment assignment is {len} bytes, limit is {}", ENV_ASSIGNMENT_LIMIT - 1)]
    EnvTooLong { len: usize },

    #[error("invalid runtime link {spec:?}: {reason}")]
    InvalidRuntimeLink { spec: String, reason: &'static str },
}

/// A namespace, mount, chroot, fork or identity operation that failed.
#[derive(Debug, Error)]
#[error("{op} failed: {errno}")]
pub struct OperationError {
    pub op: String,
    #[source]
    pub errno: Errno,
}

impl OperationError {
    pub fn new(op: impl Into<String>, errno: Errno) -> Self {
        Self {
            op: op.into(),
            errno,
        }
    }
}

/// Replacing the process image with the target program failed.
#[derive(Debug, Error)]
#[error("exec {program} failed: {errno}")]
pub struct ExecError {
    pub program: String,
    #[source]
    pub errno: Errno,
}

impl ExecError {
    pub fn new(program: &OsStr, errno: Errno) -> Self {
        Self {
            program: program.to_string_lossy().into_owned(),
            errno,
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl LaunchError {
    /// Process exit status reported for this error.
    pub fn exit_code(&self) -> i32 {
        let errno = match self {
            LaunchError::Config(_) => return 1,
            LaunchError::Operation(error) => error.errno,
            LaunchError::Exec(error) => error.errno,
        };

        match errno as i32 {
            0 => 1,
            code => code,
        }
    }
}

pub type Result<T, E = LaunchError> = std::result::Result<T, E>;

/// Attaches the name of the failing operation to a raw system error.
pub trait OperationContext<T> {
    fn op(self, op: &str) -> Result<T, OperationError>;

    fn with_op<F>(self, op: F) -> Result<T, OperationError>
    where
        F: FnOnce() -> String;
}

impl<T> OperationContext<T> for nix::Result<T> {
    fn op(self, op: &str) -> Result<T, OperationError> {
        self.map_err(|errno| OperationError::new(op, errno))
    }

    fn with_op<F>(self, op: F) -> Result<T, OperationError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|errno| OperationError::new(op(), errno))
    }
}

impl<T> OperationContext<T> for io::Result<T> {
    fn op(self, op: &str) -> Result<T, OperationError> {
        self.map_err(|error| OperationError::new(op, errno_of(&error)))
    }

    fn with_op<F>(self, op: F) -> Result<T, OperationError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|error| OperationError::new(op(), errno_of(&error)))
    }
}

fn errno_of(error: &io::Error) -> Errno {
    error.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}
