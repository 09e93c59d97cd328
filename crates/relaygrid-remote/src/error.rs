//! Error types for remote execution.

use std::time::Duration;

use relaygrid_core::FleetError;
use thiserror::Error;

/// Result type alias for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Why a single connection attempt did not produce a command result.
/// Always retryable.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },
}

/// Errors surfaced by the `RemoteExecutor` after policy is applied.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{node} unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        node: String,
        attempts: u32,
        reason: String,
    },

    /// The command ran and exited non-zero. `output` is redacted.
    #[error("command failed on {node} (exit {exit_status}): {output}")]
    Command {
        node: String,
        exit_status: i32,
        output: String,
    },

    #[error("could not take the lock of node {node}: {source}")]
    Lock {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("local io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RemoteError::Unreachable { .. })
    }
}

impl From<RemoteError> for FleetError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unreachable {
                node,
                attempts,
                reason,
            } => FleetError::Unreachable {
                target: node,
                attempts,
                reason,
            },
            RemoteError::Command {
                node,
                exit_status,
                output,
            } => FleetError::RemoteCommand {
                node,
                exit_status,
                output,
            },
            RemoteError::Lock { node, source } => FleetError::Io(std::io::Error::new(
                source.kind(),
                format!("lock of node {node}: {source}"),
            )),
            RemoteError::Io(e) => FleetError::Io(e),
        }
    }
}
