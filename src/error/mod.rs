//! Error taxonomy shared by the executor and the process facade.

mod codes;

pub use codes::{ContainerError, ProcessError};

use std::io;

use thiserror::Error;

/// Result type for executor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the executor, its processes and the serve loop
#[derive(Error, Debug)]
pub enum Error {
    /// The control channel has been shut down or the container died.
    #[error("executor is dead")]
    ExecutorDead,

    #[error("operation cancelled")]
    Cancelled,

    /// Malformed program image, import or packet.
    #[error("bad program: {0}")]
    BadProgram(String),

    #[error("resource limit reached: {0}")]
    ResourceLimit(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Sandboxed process exited with a code outside the program and trap ranges.
    #[error("process error: {0}")]
    Process(ProcessError),

    /// Container process terminated with a known exit code.
    #[error("container error: {0}")]
    Container(ContainerError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// The taxonomy kind of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ExecutorDead,
    Cancelled,
    BadProgram,
    ResourceLimit,
    Internal,
    Container,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ExecutorDead => ErrorKind::ExecutorDead,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::BadProgram(_) => ErrorKind::BadProgram,
            Error::ResourceLimit(_) => ErrorKind::ResourceLimit,
            Error::Container(_) => ErrorKind::Container,
            Error::Internal(_)
            | Error::Process(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Sys(_) => ErrorKind::Internal,
        }
    }

    /// Whether a fresh executor might succeed where this one failed.
    ///
    /// Configuration and program errors are permanent; a dead or
    /// unreachable container is worth reconnecting to.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::ExecutorDead | Error::Container(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::ExecutorDead.to_string(), "executor is dead");
        assert_eq!(
            Error::BadProgram("unknown import env.foo".into()).to_string(),
            "bad program: unknown import env.foo"
        );
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::Process(ProcessError::from_code(5)).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            Error::Container(ContainerError::from_code(1)).kind(),
            ErrorKind::Container
        );
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(Error::from(io_err).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_retriable() {
        assert!(Error::ExecutorDead.is_retriable());
        assert!(Error::from(io::Error::from(io::ErrorKind::ConnectionRefused)).is_retriable());
        assert!(!Error::Config("max_procs".into()).is_retriable());
        assert!(!Error::BadProgram("x".into()).is_retriable());
    }

    #[test]
    fn test_errno_conversion() {
        let err = Error::from(nix::errno::Errno::EBADF);
        assert!(err.to_string().contains("system call failed"));
    }
}
