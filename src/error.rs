//! Error taxonomy for a single evaluation
//!
//! Every variant is terminal for the request that produced it. The `Display`
//! text is what the caller sees in the `msg` field of the exit message.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    /// The inbound request frame could not be understood
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Version identifier that cannot name a cache directory
    #[error("Invalid version: {0:?}")]
    InvalidVersion(String),

    /// Remote source failed or answered with a non-success status
    #[error("Failed to download binary: {0}")]
    FetchFailed(String),

    /// A workspace file would land outside the workspace root
    #[error("Invalid file path (traversal attempt): {0}")]
    InvalidPath(String),

    /// Local filesystem failure while staging
    #[error("{context}: {source}")]
    IoFailure {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The process or its pseudo-terminal could not be started
    #[error("Failed to start pty: {0}")]
    LaunchFailed(String),

    /// Unexpected failure reading the terminal output
    #[error("Output stream error: {0}")]
    StreamError(String),

    /// Waiting on the launched process failed
    #[error("Failed to wait for process: {0}")]
    WaitFailed(String),
}

impl EvalError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::IoFailure {
            context: context.into(),
            source,
        }
    }
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_failure_display_includes_context() {
        let err = EvalError::io(
            "Failed to create temp dir",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.to_string(), "Failed to create temp dir: denied");
    }

    #[test]
    fn test_traversal_message() {
        let err = EvalError::InvalidPath("../../etc/passwd".into());
        assert_eq!(
            err.to_string(),
            "Invalid file path (traversal attempt): ../../etc/passwd"
        );
    }
}
