//! Wire types of the panel API.

use relaygrid_core::Secret;
use serde::{Deserialize, Serialize};

/// Admin login.
#[derive(Debug, Clone)]
pub struct PanelCredentials {
    pub username: String,
    pub password: Secret,
}

impl PanelCredentials {
    pub fn new(username: impl Into<String>, password: Secret) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

/// Body of `POST /node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewNode {
    pub name: String,
    pub address: String,
    /// Port the panel reaches the node service on.
    pub port: u16,
    pub api_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelNodeStatus {
    Connected,
    Connecting,
    Error,
    Disabled,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for PanelNodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PanelNodeStatus::Connected => "connected",
            PanelNodeStatus::Connecting => "connecting",
            PanelNodeStatus::Error => "error",
            PanelNodeStatus::Disabled => "disabled",
            PanelNodeStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A node as the panel reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelNode {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub status: PanelNodeStatus,
    #[serde(default)]
    pub client_cert: Option<String>,
}

impl PanelNode {
    /// The issued PEM, if the panel has one yet.
    pub fn certificate(&self) -> Option<&str> {
        self.client_cert
            .as_deref()
            .filter(|pem| !pem.trim().is_empty())
    }

    pub fn is_connected(&self) -> bool {
        self.status == PanelNodeStatus::Connected
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_does_not_fail_decoding() {
        let node: PanelNode =
            serde_json::from_str(r#"{"id": 3, "name": "a", "status": "limited"}"#).unwrap();
        assert_eq!(node.status, PanelNodeStatus::Unknown);
        assert!(node.certificate().is_none());
    }

    #[test]
    fn blank_certificate_counts_as_missing() {
        let node: PanelNode = serde_json::from_str(
            r#"{"id": 3, "name": "a", "address": "10.0.0.5", "status": "connected", "client_cert": "  "}"#,
        )
        .unwrap();
        assert!(node.is_connected());
        assert!(node.certificate().is_none());
    }
}
