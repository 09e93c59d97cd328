//! Fleet-wide error taxonomy.
//!
//! Each relaygrid crate has its own error enum for its internals; all of
//! them convert into `FleetError` at the orchestrator boundary so that
//! operators see one consistent set of failure kinds.

use thiserror::Error;

/// Result alias for orchestrator-level operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Bad input. Nothing was changed; the caller must correct and retry.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A remote endpoint did not answer within the retry bound.
    #[error("{target} unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        target: String,
        attempts: u32,
        reason: String,
    },

    /// A remote command ran and reported failure. Never retried.
    #[error("command failed on {node} (exit {exit_status}): {output}")]
    RemoteCommand {
        node: String,
        exit_status: i32,
        output: String,
    },

    #[error("node name already registered: {0}")]
    DuplicateName(String),

    #[error("no certificate issued for {node} after {attempts} poll(s)")]
    CertificateTimeout { node: String, attempts: u32 },

    /// The rendered load balancer config failed the balancer's own validator.
    #[error("load balancer rejected config: {0}")]
    ConfigValidation(String),

    /// Restoring a node's previous config failed. The node is in an unknown
    /// configuration state and needs a human.
    #[error("rollback failed on {node}, configuration state unknown: {reason}")]
    SyncRollback { node: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("control plane rejected credentials: {0}")]
    Auth(String),

    #[error("control plane error (HTTP {status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Whether this error leaves a node in an unknown state.
    pub fn needs_escalation(&self) -> bool {
        matches!(self, FleetError::SyncRollback { .. })
    }

    /// Whether the error was raised before any side effect happened.
    pub fn is_rejection(&self) -> bool {
        matches!(self, FleetError::Validation(_) | FleetError::DuplicateName(_))
    }
}
