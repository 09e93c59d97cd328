//! Domain types for the node registry.
//!
//! A `NodeRecord` is the single persisted unit. Routing rules, config
//! snapshots and rollback points are all derived from records elsewhere
//! and never stored here.

use std::net::IpAddr;
use std::path::PathBuf;

use relaygrid_core::Secret;
use serde::{Deserialize, Serialize};

/// Fleet-unique, immutable node name.
pub type NodeName = String;

/// Identifier the control plane assigned to a node.
pub type ControlPlaneNodeId = u64;

// ── Lifecycle ─────────────────────────────────────────────────────

/// Lifecycle state of a managed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Registering,
    AwaitingCertificate,
    Deploying,
    Active,
    /// Deployed, but health could not be confirmed.
    Degraded,
    /// Provisioning stopped on an unrecoverable error.
    Failed,
    Removed,
}

impl NodeState {
    /// States in which a control-plane id may be set. `Failed` keeps the id
    /// of a registration that succeeded so the run can be resumed.
    pub fn may_hold_node_id(self) -> bool {
        matches!(
            self,
            NodeState::AwaitingCertificate
                | NodeState::Deploying
                | NodeState::Active
                | NodeState::Degraded
                | NodeState::Failed
        )
    }

    /// States in which a control-plane id must be set.
    pub fn requires_node_id(self) -> bool {
        matches!(
            self,
            NodeState::AwaitingCertificate
                | NodeState::Deploying
                | NodeState::Active
                | NodeState::Degraded
        )
    }

    /// Deployed nodes the sync engine and the monitor operate on.
    pub fn is_serving(self) -> bool {
        matches!(self, NodeState::Active | NodeState::Degraded)
    }

    pub fn is_removed(self) -> bool {
        self == NodeState::Removed
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Registering => "registering",
            NodeState::AwaitingCertificate => "awaiting_certificate",
            NodeState::Deploying => "deploying",
            NodeState::Active => "active",
            NodeState::Degraded => "degraded",
            NodeState::Failed => "failed",
            NodeState::Removed => "removed",
        };
        f.write_str(s)
    }
}

// ── SSH access ────────────────────────────────────────────────────

/// How the orchestrator authenticates to a node's shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SshCredential {
    Password { password: Secret },
    KeyFile { path: PathBuf },
    /// Whatever the local ssh agent offers.
    Agent,
}

impl SshCredential {
    /// The secret value to scrub from logs, if any.
    pub fn secret(&self) -> Option<&Secret> {
        match self {
            SshCredential::Password { password } => Some(password),
            SshCredential::KeyFile { .. } | SshCredential::Agent => None,
        }
    }
}

/// Shell endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshAccess {
    pub port: u16,
    pub user: String,
    pub credential: SshCredential,
}

impl SshAccess {
    pub fn new(user: impl Into<String>, port: u16, credential: SshCredential) -> Self {
        Self {
            port,
            user: user.into(),
            credential,
        }
    }
}

// ── Node record ───────────────────────────────────────────────────

/// One managed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: NodeName,
    pub address: IpAddr,
    pub ssh: SshAccess,
    /// SNI hostname routed to this node.
    pub domain: String,
    /// Port the node's proxy service accepts routed traffic on.
    pub backend_port: u16,
    pub control_plane_node_id: Option<ControlPlaneNodeId>,
    pub state: NodeState,
    /// Insertion order, assigned by the registry.
    #[serde(default)]
    pub seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
    /// Reason of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl NodeRecord {
    /// A fresh onboarding request in `Pending`.
    pub fn pending(
        name: impl Into<String>,
        address: IpAddr,
        domain: impl Into<String>,
        backend_port: u16,
        ssh: SshAccess,
    ) -> Self {
        let now = relaygrid_core::epoch_secs();
        Self {
            name: name.into(),
            address,
            ssh,
            domain: domain.into(),
            backend_port,
            control_plane_node_id: None,
            state: NodeState::Pending,
            seq: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Copy of this record moved to `state`.
    pub fn transitioned(&self, state: NodeState) -> Self {
        let mut next = self.clone();
        next.state = state;
        next.updated_at = relaygrid_core::epoch_secs();
        if state != NodeState::Failed {
            next.last_error = None;
        }
        next
    }

    /// Copy of this record moved to `Failed` with a reason.
    pub fn failed(&self, reason: impl Into<String>) -> Self {
        let mut next = self.transitioned(NodeState::Failed);
        next.last_error = Some(reason.into());
        next
    }

    /// Backend target the load balancer forwards this node's domain to.
    pub fn backend_target(&self) -> String {
        match self.address {
            IpAddr::V4(ip) => format!("{ip}:{}", self.backend_port),
            IpAddr::V6(ip) => format!("[{ip}]:{}", self.backend_port),
        }
    }

    /// Check the id/state invariant.
    pub fn check_invariants(&self) -> Result<(), String> {
        match (self.control_plane_node_id, self.state) {
            (Some(_), state) if !state.may_hold_node_id() => {
                Err(format!("state {state} cannot carry a control-plane id"))
            }
            (None, state) if state.requires_node_id() => {
                Err(format!("state {state} requires a control-plane id"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> NodeRecord {
        NodeRecord::pending(
            "node-a",
            "10.0.0.1".parse().unwrap(),
            "a.example.com",
            443,
            SshAccess::new(
                "root",
                22,
                SshCredential::Password {
                    password: Secret::new("pw"),
                },
            ),
        )
    }

    #[test]
    fn record_roundtrips_every_field() {
        let mut rec = record().transitioned(NodeState::AwaitingCertificate);
        rec.control_plane_node_id = Some(17);
        rec.seq = 4;
        rec.last_error = Some("previous".to_string());

        let json = serde_json::to_vec(&rec).unwrap();
        let back: NodeRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn null_id_and_state_serialize_plainly() {
        let json = serde_json::to_value(record()).unwrap();
        assert!(json["control_plane_node_id"].is_null());
        assert_eq!(json["state"], "pending");
        assert_eq!(json["ssh"]["credential"]["kind"], "password");
    }

    #[test]
    fn invariants_follow_state() {
        let mut rec = record();
        assert!(rec.check_invariants().is_ok());

        rec.control_plane_node_id = Some(1);
        assert!(rec.check_invariants().is_err()); // pending with id

        rec.state = NodeState::Active;
        assert!(rec.check_invariants().is_ok());

        rec.state = NodeState::Failed;
        assert!(rec.check_invariants().is_ok()); // kept for resumption

        rec.control_plane_node_id = None;
        rec.state = NodeState::Deploying;
        assert!(rec.check_invariants().is_err());
    }

    #[test]
    fn backend_target_brackets_ipv6() {
        let mut rec = record();
        assert_eq!(rec.backend_target(), "10.0.0.1:443");
        rec.address = "fd00::5".parse().unwrap();
        assert_eq!(rec.backend_target(), "[fd00::5]:443");
    }

    #[test]
    fn failed_records_reason_and_transition_clears_it() {
        let failed = record().failed("boom");
        assert_eq!(failed.state, NodeState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));

        let retried = failed.transitioned(NodeState::Registering);
        assert!(retried.last_error.is_none());
    }
}
