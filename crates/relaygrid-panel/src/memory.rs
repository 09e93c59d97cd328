//! In-memory control plane for tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use relaygrid_core::Secret;

use crate::ControlPlane;
use crate::error::{PanelError, PanelResult};
use crate::types::{NewNode, PanelNode, PanelNodeStatus};

/// When a registered node gets its certificate.
#[derive(Debug, Clone, Copy)]
enum Issuance {
    Immediately,
    AfterPolls(u32),
    Never,
}

#[derive(Debug)]
struct PanelState {
    nodes: BTreeMap<u64, PanelNode>,
    polls: BTreeMap<u64, u32>,
    next_id: u64,
    issuance: Issuance,
    status_on_add: PanelNodeStatus,
    token: Option<Secret>,
    reject_credentials: bool,
    unreachable: bool,
    fail_deletes: bool,
    auth_calls: u32,
    add_calls: u32,
    deleted: Vec<u64>,
}

impl Default for PanelState {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            polls: BTreeMap::new(),
            next_id: 1,
            issuance: Issuance::Immediately,
            status_on_add: PanelNodeStatus::Connected,
            token: None,
            reject_credentials: false,
            unreachable: false,
            fail_deletes: false,
            auth_calls: 0,
            add_calls: 0,
            deleted: Vec::new(),
        }
    }
}

impl PanelState {
    fn reachable(&self) -> PanelResult<()> {
        if self.unreachable {
            return Err(PanelError::Unreachable {
                attempts: 1,
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn authorized(&self) -> PanelResult<()> {
        self.reachable()?;
        if self.reject_credentials {
            return Err(PanelError::Auth("Incorrect username or password".to_string()));
        }
        Ok(())
    }
}

/// `ControlPlane` backed by a map. Registered nodes are `connected` and get
/// a certificate at once unless configured otherwise.
#[derive(Debug, Default)]
pub struct MemoryPanel {
    state: Mutex<PanelState>,
}

impl MemoryPanel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PanelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn never_issue_certificates(&self) {
        self.lock().issuance = Issuance::Never;
    }

    /// Certificates show up on the `polls`-th `get_node` of a node.
    pub fn issue_certificates_after(&self, polls: u32) {
        self.lock().issuance = Issuance::AfterPolls(polls);
    }

    pub fn issue_certificates_immediately(&self) {
        self.lock().issuance = Issuance::Immediately;
    }

    /// Status newly registered nodes report.
    pub fn set_status_on_add(&self, status: PanelNodeStatus) {
        self.lock().status_on_add = status;
    }

    pub fn set_status(&self, name: &str, status: PanelNodeStatus) {
        let mut state = self.lock();
        if let Some(node) = state.nodes.values_mut().find(|n| n.name == name) {
            node.status = status;
        }
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.lock().reject_credentials = reject;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    /// Register a node out of band, as if an earlier run had done it.
    pub fn preload(&self, name: &str, address: &str) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.nodes.insert(
            id,
            PanelNode {
                id,
                name: name.to_string(),
                address: address.to_string(),
                status: PanelNodeStatus::Connecting,
                client_cert: None,
            },
        );
        id
    }

    pub fn node_by_name(&self, name: &str) -> Option<PanelNode> {
        self.lock().nodes.values().find(|n| n.name == name).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn auth_calls(&self) -> u32 {
        self.lock().auth_calls
    }

    pub fn add_calls(&self) -> u32 {
        self.lock().add_calls
    }

    pub fn deleted(&self) -> Vec<u64> {
        self.lock().deleted.clone()
    }
}

fn certificate_for(id: u64) -> String {
    format!("-----BEGIN CERTIFICATE-----\nMEMORY-PANEL-NODE-{id}\n-----END CERTIFICATE-----\n")
}

#[async_trait]
impl ControlPlane for MemoryPanel {
    async fn authenticate(&self) -> PanelResult<Secret> {
        let mut state = self.lock();
        state.authorized()?;
        if let Some(token) = &state.token {
            return Ok(token.clone());
        }
        state.auth_calls += 1;
        let token = Secret::new(format!("memory-token-{}", state.auth_calls));
        state.token = Some(token.clone());
        Ok(token)
    }

    fn invalidate_token(&self) {
        self.lock().token = None;
    }

    async fn add_node(&self, node: &NewNode) -> PanelResult<u64> {
        let mut state = self.lock();
        state.authorized()?;
        state.add_calls += 1;
        if let Some(existing) = state.nodes.values().find(|n| n.name == node.name) {
            return Ok(existing.id);
        }
        let id = state.next_id;
        state.next_id += 1;
        let status = state.status_on_add;
        state.nodes.insert(
            id,
            PanelNode {
                id,
                name: node.name.clone(),
                address: node.address.clone(),
                status,
                client_cert: None,
            },
        );
        Ok(id)
    }

    async fn get_node(&self, id: u64) -> PanelResult<PanelNode> {
        let mut state = self.lock();
        state.authorized()?;
        let polls = {
            let count = state.polls.entry(id).or_default();
            *count += 1;
            *count
        };
        let issue = match state.issuance {
            Issuance::Immediately => true,
            Issuance::AfterPolls(n) => polls >= n,
            Issuance::Never => false,
        };
        let node = state.nodes.get_mut(&id).ok_or(PanelError::NotFound(id))?;
        if issue && node.client_cert.is_none() {
            node.client_cert = Some(certificate_for(id));
        }
        Ok(node.clone())
    }

    async fn list_nodes(&self) -> PanelResult<Vec<PanelNode>> {
        let state = self.lock();
        state.authorized()?;
        Ok(state.nodes.values().cloned().collect())
    }

    async fn delete_node(&self, id: u64) -> PanelResult<()> {
        let mut state = self.lock();
        state.authorized()?;
        if state.fail_deletes {
            return Err(PanelError::Api {
                status: 500,
                detail: "internal error".to_string(),
            });
        }
        if state.nodes.remove(&id).is_none() {
            return Err(PanelError::NotFound(id));
        }
        state.deleted.push(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_node(name: &str) -> NewNode {
        NewNode {
            name: name.to_string(),
            address: "10.0.0.5".to_string(),
            port: 62050,
            api_port: 62051,
        }
    }

    #[tokio::test]
    async fn add_is_idempotent_by_name() {
        let panel = MemoryPanel::new();
        let first = panel.add_node(&new_node("c")).await.unwrap();
        let second = panel.add_node(&new_node("c")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(panel.node_count(), 1);
    }

    #[tokio::test]
    async fn certificate_appears_after_configured_polls() {
        let panel = MemoryPanel::new();
        panel.issue_certificates_after(3);
        let id = panel.add_node(&new_node("c")).await.unwrap();

        assert!(panel.get_node(id).await.unwrap().certificate().is_none());
        assert!(panel.get_node(id).await.unwrap().certificate().is_none());
        assert!(panel.get_node(id).await.unwrap().certificate().is_some());
    }

    #[tokio::test]
    async fn token_is_cached_until_invalidated() {
        let panel = MemoryPanel::new();
        panel.authenticate().await.unwrap();
        panel.authenticate().await.unwrap();
        assert_eq!(panel.auth_calls(), 1);

        panel.invalidate_token();
        panel.authenticate().await.unwrap();
        assert_eq!(panel.auth_calls(), 2);
    }
}
