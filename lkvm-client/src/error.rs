//! Error types for the lifecycle client.

use std::time::Duration;
use thiserror::Error;

use crate::types::InstanceState;

/// Failures invoking the external hypervisor tool.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The executable could not be resolved.
    #[error("Executable not found: {program}")]
    NotFound { program: String },

    /// The invocation exceeded its timeout and was killed.
    #[error("Command {program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// The process exited with a nonzero status.
    #[error("Command {program} exited with code {code}: {stderr}")]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },

    /// The caller lacks the privileges the tool needs.
    #[error("Permission denied running {program}: {reason}")]
    PermissionDenied { program: String, reason: String },

    /// The invocation itself is malformed (e.g. zero timeout).
    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    /// Spawning or waiting on the child failed.
    #[error("I/O error running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures turning tool output into records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The output does not match any known schema version.
    #[error("Unexpected output format: {0}")]
    UnexpectedFormat(String),

    /// The output ended early or was cut off.
    #[error("Truncated output: {0}")]
    TruncatedOutput(String),
}

/// Lifecycle and registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// No instance with this name is known.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// An instance with this name is already registered.
    #[error("Instance already exists: {0}")]
    AlreadyExists(String),

    /// The current state does not permit the operation.
    #[error("Cannot {op} instance {name} in state {from}")]
    InvalidTransition {
        name: String,
        from: InstanceState,
        op: &'static str,
    },

    /// The tool reported success but the observed state disagrees.
    #[error("Instance {name} expected {expected} but observed {observed}")]
    StateMismatch {
        name: String,
        expected: InstanceState,
        observed: InstanceState,
    },
}

/// Top-level client error.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    State(#[from] StateError),

    /// Invalid configuration or instance spec.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// True for `StateError::NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::State(StateError::NotFound(_)))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
