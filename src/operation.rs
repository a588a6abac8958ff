//! Requests, operations and their per-endpoint results

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{ErrorKind, FleetError, Result};
use crate::ssh::sanitize::{sanitize_command, validate_remote_path};
use crate::ssh::{CommandOutput, Endpoint, EndpointId};

/// Something to do on one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Run a shell command
    Exec { command: String },

    /// Copy a local file to the remote host
    Push {
        local_path: PathBuf,
        remote_path: String,
    },

    /// Copy a remote file to the local host
    Pull {
        remote_path: String,
        local_path: PathBuf,
    },

    /// Push a script, make it executable, run it, then remove it
    ExecuteFile {
        local_path: PathBuf,
        remote_path: String,
    },
}

impl Operation {
    pub fn exec(command: impl Into<String>) -> Self {
        Operation::Exec {
            command: command.into(),
        }
    }

    pub fn push(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Operation::Push {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
        }
    }

    pub fn pull(remote_path: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Operation::Pull {
            remote_path: remote_path.into(),
            local_path: local_path.into(),
        }
    }

    pub fn execute_file(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Operation::ExecuteFile {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Exec { .. } => "exec",
            Operation::Push { .. } => "push",
            Operation::Pull { .. } => "pull",
            Operation::ExecuteFile { .. } => "execute_file",
        }
    }

    /// Reject requests that can never succeed
    pub fn validate(&self, max_command_chars: Option<usize>) -> Result<()> {
        match self {
            Operation::Exec { command } => sanitize_command(command, max_command_chars).map(|_| ()),
            Operation::Push {
                local_path,
                remote_path,
            }
            | Operation::Pull {
                remote_path,
                local_path,
            }
            | Operation::ExecuteFile {
                local_path,
                remote_path,
            } => {
                if local_path.as_os_str().is_empty() {
                    return Err(FleetError::invalid_params("Local path cannot be empty"));
                }
                validate_remote_path(remote_path)
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Exec { command } => write!(f, "exec `{}`", command),
            Operation::Push {
                local_path,
                remote_path,
            } => write!(f, "push {} -> {}", local_path.display(), remote_path),
            Operation::Pull {
                remote_path,
                local_path,
            } => write!(f, "pull {} -> {}", remote_path, local_path.display()),
            Operation::ExecuteFile {
                local_path,
                remote_path,
            } => write!(
                f,
                "execute_file {} as {}",
                local_path.display(),
                remote_path
            ),
        }
    }
}

/// One unit of work in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub endpoint: Endpoint,
    pub operation: Operation,
}

impl Request {
    pub fn new(endpoint: Endpoint, operation: Operation) -> Self {
        Self {
            endpoint,
            operation,
        }
    }
}

/// Why a request failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    /// Captured output when the remote command ran but failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CommandOutput>,
}

impl From<&FleetError> for Failure {
    fn from(err: &FleetError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            output: err.output().cloned(),
        }
    }
}

/// Outcome of one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { stdout: String, exit_code: u32 },
    Failure(Failure),
}

/// Result of one request, produced exactly once per request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub endpoint: EndpointId,
    pub operation: Operation,
    pub outcome: Outcome,
    /// Attempts made, including retries
    pub attempts: u32,
}

impl OperationResult {
    pub fn new(
        endpoint: EndpointId,
        operation: Operation,
        result: Result<CommandOutput>,
        attempts: u32,
    ) -> Self {
        let outcome = match result {
            Ok(output) => Outcome::Success {
                exit_code: output.status(),
                stdout: output.stdout,
            },
            Err(err) => Outcome::Failure(Failure::from(&err)),
        };
        Self {
            endpoint,
            operation,
            outcome,
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.outcome {
            Outcome::Failure(failure) => Some(failure),
            Outcome::Success { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure().map(|f| f.kind)
    }

    pub fn stdout(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success { stdout, .. } => Some(stdout),
            Outcome::Failure(_) => None,
        }
    }
}
