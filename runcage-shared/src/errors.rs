//! Error types used across the runcage supervisor and jailer.

use thiserror::Error;

/// Result type for runcage operations.
pub type RuncageResult<T> = Result<T, RuncageError>;

#[derive(Debug, Error)]
pub enum RuncageError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    /// A control file exists but is not one of the known cgroup controls.
    #[error("invalid control {0}")]
    InvalidControl(String),

    /// A controller is not listed in `cgroup.controllers`.
    #[error("unavailable control {0}")]
    UnavailableControl(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("unknown namespace {0}")]
    Namespace(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("rlimit error: {0}")]
    Rlimit(String),

    #[error("landlock error: {0}")]
    Landlock(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("execution error: {0}")]
    Exec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

// `From` impls for the error sources every module touches, so `?` works
// without per-call mapping.
impl From<std::io::Error> for RuncageError {
    fn from(err: std::io::Error) -> Self {
        RuncageError::Internal(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for RuncageError {
    fn from(err: serde_json::Error) -> Self {
        RuncageError::Internal(format!("JSON error: {}", err))
    }
}

impl From<nix::Error> for RuncageError {
    fn from(err: nix::Error) -> Self {
        RuncageError::Internal(format!("system error: {}", err))
    }
}

impl From<String> for RuncageError {
    fn from(err: String) -> Self {
        RuncageError::Internal(err)
    }
}

impl From<&str> for RuncageError {
    fn from(err: &str) -> Self {
        RuncageError::Internal(err.to_string())
    }
}
