//! Error types for the node registry.

use std::path::PathBuf;

use relaygrid_core::FleetError;
use thiserror::Error;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to open registry: {0}")]
    Open(String),

    /// Another handle kept the registry file open past the wait limit.
    #[error("registry {} is busy", .0.display())]
    Busy(PathBuf),

    #[error("registry storage error: {0}")]
    Storage(String),

    #[error("corrupt node record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node name already registered: {0}")]
    DuplicateName(String),

    /// The record violates a registry invariant and was not written.
    #[error("invalid record {name}: {reason}")]
    Invariant { name: String, reason: String },
}

impl From<redb::DatabaseError> for RegistryError {
    fn from(err: redb::DatabaseError) -> Self {
        RegistryError::Open(err.to_string())
    }
}

macro_rules! storage_errors {
    ($($ty:ty),+) => {
        $(impl From<$ty> for RegistryError {
            fn from(err: $ty) -> Self {
                RegistryError::Storage(err.to_string())
            }
        })+
    };
}

storage_errors!(
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

impl From<RegistryError> for FleetError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateName(name) => FleetError::DuplicateName(name),
            RegistryError::NotFound(name) => FleetError::NotFound(format!("node {name}")),
            RegistryError::Invariant { .. } => FleetError::Validation(err.to_string()),
            other => FleetError::Registry(other.to_string()),
        }
    }
}
