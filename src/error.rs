//! Error types for ssh-fleet

use std::io;

use serde::Serialize;
use thiserror::Error;

use crate::ssh::CommandOutput;

/// Main error type for sessions, the pool and the dispatcher
#[derive(Debug, Error)]
pub enum FleetError {
    /// Connection setup failed (network, authentication or host key)
    #[error("SSH connection error: {0}")]
    Connect(String),

    /// Remote command finished with a non-zero exit status
    #[error("Command exited with status {exit_code}{}", stderr_suffix(.output))]
    Execution {
        /// Exit status reported by the remote side
        exit_code: u32,
        /// Everything the command printed before exiting
        output: CommandOutput,
    },

    /// File transfer failed on either side
    #[error("Transfer error: {message}")]
    Transfer {
        /// Human readable description
        message: String,
        /// Whether retrying on a fresh connection may succeed
        transient: bool,
    },

    /// Operation exceeded its deadline
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// No connection capacity left and the pool is in non-blocking mode
    #[error("Connection pool exhausted ({0} connections open)")]
    PoolExhausted(usize),

    /// The pool has been shut down
    #[error("Session pool is closed")]
    PoolClosed,

    /// Session used in a state that does not allow the operation
    #[error("Session is not ready (state: {0})")]
    NotReady(crate::session::SessionState),

    /// The operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid parameters provided
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// SSH key parsing error
    #[error("SSH key error: {0}")]
    SshKey(String),

    /// A worker failed in a way no request caused
    #[error("Internal error: {0}")]
    Internal(String),
}

fn stderr_suffix(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

// io::Error is not Clone; a copy keeps its kind and message
impl Clone for FleetError {
    fn clone(&self) -> Self {
        match self {
            FleetError::Connect(msg) => FleetError::Connect(msg.clone()),
            FleetError::Execution { exit_code, output } => FleetError::Execution {
                exit_code: *exit_code,
                output: output.clone(),
            },
            FleetError::Transfer { message, transient } => FleetError::Transfer {
                message: message.clone(),
                transient: *transient,
            },
            FleetError::Timeout(ms) => FleetError::Timeout(*ms),
            FleetError::PoolExhausted(max) => FleetError::PoolExhausted(*max),
            FleetError::PoolClosed => FleetError::PoolClosed,
            FleetError::NotReady(state) => FleetError::NotReady(*state),
            FleetError::Cancelled => FleetError::Cancelled,
            FleetError::InvalidParams(msg) => FleetError::InvalidParams(msg.clone()),
            FleetError::Config(msg) => FleetError::Config(msg.clone()),
            FleetError::Io(err) => FleetError::Io(io::Error::new(err.kind(), err.to_string())),
            FleetError::SshKey(msg) => FleetError::SshKey(msg.clone()),
            FleetError::Internal(msg) => FleetError::Internal(msg.clone()),
        }
    }
}

/// Result type alias using FleetError
pub type Result<T> = std::result::Result<T, FleetError>;

/// Classification of a failure as seen by callers of the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ErrorKind {
    Connect,
    Execution { exit_code: u32 },
    Transfer,
    Timeout,
    PoolExhausted,
    Cancelled,
    InvalidRequest,
    Internal,
}

impl FleetError {
    /// Create a connection error from a string
    pub fn connect(msg: impl Into<String>) -> Self {
        FleetError::Connect(msg.into())
    }

    /// Create a transfer error that is worth retrying
    pub fn transient_transfer(msg: impl Into<String>) -> Self {
        FleetError::Transfer {
            message: msg.into(),
            transient: true,
        }
    }

    /// Create a transfer error that will fail again if retried
    pub fn transfer(msg: impl Into<String>) -> Self {
        FleetError::Transfer {
            message: msg.into(),
            transient: false,
        }
    }

    /// Create an invalid params error from a string
    pub fn invalid_params(msg: impl Into<String>) -> Self {
        FleetError::InvalidParams(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        FleetError::Config(msg.into())
    }

    /// Create a timeout error from the elapsed deadline
    pub fn timeout(after: std::time::Duration) -> Self {
        FleetError::Timeout(after.as_millis() as u64)
    }

    /// Map a local or remote I/O failure into a transfer error
    pub fn from_transfer_io(context: &str, err: io::Error) -> Self {
        FleetError::Transfer {
            message: format!("{}: {}", context, err),
            transient: is_transient_io(&err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Connect(_) | FleetError::SshKey(_) => ErrorKind::Connect,
            FleetError::Execution { exit_code, .. } => ErrorKind::Execution {
                exit_code: *exit_code,
            },
            FleetError::Transfer { .. } | FleetError::Io(_) => ErrorKind::Transfer,
            FleetError::Timeout(_) => ErrorKind::Timeout,
            FleetError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            FleetError::PoolClosed | FleetError::Cancelled => ErrorKind::Cancelled,
            FleetError::InvalidParams(_) | FleetError::Config(_) => ErrorKind::InvalidRequest,
            FleetError::NotReady(_) | FleetError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the dispatcher may retry the request that produced this error.
    ///
    /// Only connection failures and transient transfer failures qualify.
    /// Timeouts are never retried since the remote side may still be running.
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::Connect(_) => true,
            FleetError::Transfer { transient, .. } => *transient,
            FleetError::Io(err) => is_transient_io(err),
            _ => false,
        }
    }

    /// Captured command output, available for execution failures
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            FleetError::Execution { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// I/O failures that usually mean the connection went away mid-transfer
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

impl From<russh::Error> for FleetError {
    fn from(err: russh::Error) -> Self {
        FleetError::Connect(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for FleetError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        use russh_sftp::client::error::Error as SftpError;

        // Status replies (no such file, permission denied) are definitive
        match &err {
            SftpError::Status(_) => FleetError::transfer(err.to_string()),
            _ => FleetError::transient_transfer(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FleetError::Connect("failed to connect".to_string());
        assert_eq!(err.to_string(), "SSH connection error: failed to connect");

        let err = FleetError::Timeout(5000);
        assert_eq!(err.to_string(), "Operation timed out after 5000ms");
    }

    #[test]
    fn test_execution_error_display_includes_stderr() {
        let err = FleetError::Execution {
            exit_code: 2,
            output: CommandOutput {
                stdout: String::new(),
                stderr: "no such file\n".to_string(),
                exit_code: Some(2),
            },
        };
        assert_eq!(err.to_string(), "Command exited with status 2: no such file");

        let err = FleetError::Execution {
            exit_code: 1,
            output: CommandOutput::default(),
        };
        assert_eq!(err.to_string(), "Command exited with status 1");
    }

    #[test]
    fn test_cloned_io_error_keeps_kind() {
        let err = FleetError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        let copy = err.clone();
        assert!(copy.is_retryable());
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn test_retry_classification() {
        assert!(FleetError::connect("refused").is_retryable());
        assert!(FleetError::transient_transfer("reset").is_retryable());
        assert!(!FleetError::transfer("permission denied").is_retryable());
        assert!(!FleetError::Timeout(10).is_retryable());
        assert!(!FleetError::Execution {
            exit_code: 1,
            output: CommandOutput::default()
        }
        .is_retryable());
        assert!(!FleetError::PoolExhausted(4).is_retryable());
    }

    #[test]
    fn test_io_errors_classified_by_kind() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(FleetError::from_transfer_io("upload", reset).is_retryable());

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = FleetError::from_transfer_io("open local file", denied);
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert!(err.to_string().contains("open local file"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(FleetError::connect("x").kind(), ErrorKind::Connect);
        assert_eq!(FleetError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(FleetError::PoolClosed.kind(), ErrorKind::Cancelled);
        assert_eq!(
            FleetError::invalid_params("empty").kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            FleetError::Execution {
                exit_code: 3,
                output: CommandOutput::default()
            }
            .kind(),
            ErrorKind::Execution { exit_code: 3 }
        );
    }
}
