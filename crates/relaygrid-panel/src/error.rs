use relaygrid_core::FleetError;
use thiserror::Error;

pub type PanelResult<T> = Result<T, PanelError>;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("control plane unreachable after {attempts} attempt(s): {reason}")]
    Unreachable { attempts: u32, reason: String },

    #[error("control plane rejected credentials: {0}")]
    Auth(String),

    #[error("control plane error (HTTP {status}): {detail}")]
    Api { status: u16, detail: String },

    #[error("control-plane node {0} not found")]
    NotFound(u64),

    #[error("unexpected control-plane response (HTTP {status}): {reason}")]
    Decode { status: u16, reason: String },

    #[error("failed to build http client: {0}")]
    Build(String),
}

impl PanelError {
    /// Failures worth another attempt: the request may not have been seen.
    pub fn is_transient(&self) -> bool {
        match self {
            PanelError::Unreachable { .. } => true,
            PanelError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<PanelError> for FleetError {
    fn from(err: PanelError) -> Self {
        match err {
            PanelError::Unreachable { attempts, reason } => FleetError::Unreachable {
                target: "control plane".to_string(),
                attempts,
                reason,
            },
            PanelError::Auth(detail) => FleetError::Auth(detail),
            PanelError::Api { status, detail } => FleetError::Api { status, detail },
            PanelError::NotFound(id) => FleetError::NotFound(format!("control-plane node {id}")),
            PanelError::Decode { status, reason } => FleetError::Api {
                status,
                detail: reason,
            },
            PanelError::Build(reason) => FleetError::Validation(reason),
        }
    }
}
