//! Control-plane health of serving nodes.

use relaygrid_core::FleetResult;
use relaygrid_panel::{ControlPlane, PanelError};
use relaygrid_registry::NodeRecord;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnhealthyNode {
    pub node: String,
    /// Status the panel reported, or why none could be read.
    pub status: String,
}

/// Result of one health pass over the serving nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: Vec<String>,
    pub unhealthy: Vec<UnhealthyNode>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.unhealthy.is_empty()
    }
}

/// Ask the panel about one node. `Ok(None)` means connected.
///
/// A node the panel no longer knows is unhealthy, not an error; losing the
/// panel itself is.
pub async fn probe(panel: &dyn ControlPlane, id: u64) -> FleetResult<Option<String>> {
    match panel.get_node(id).await {
        Ok(node) if node.is_connected() => Ok(None),
        Ok(node) => Ok(Some(node.status.to_string())),
        Err(PanelError::NotFound(_)) => Ok(Some("not registered".to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Check every serving record that has a control-plane id.
pub async fn check_health(panel: &dyn ControlPlane, records: &[NodeRecord]) -> FleetResult<HealthReport> {
    let mut report = HealthReport::default();
    for record in records.iter().filter(|r| r.state.is_serving()) {
        let Some(id) = record.control_plane_node_id else {
            continue;
        };
        match probe(panel, id).await? {
            None => report.healthy.push(record.name.clone()),
            Some(status) => {
                debug!(node = %record.name, %status, "node not connected");
                report.unhealthy.push(UnhealthyNode {
                    node: record.name.clone(),
                    status,
                });
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_core::{FleetError, Secret};
    use relaygrid_panel::{MemoryPanel, PanelNodeStatus};
    use relaygrid_registry::{NodeState, SshAccess, SshCredential};

    fn record(name: &str, id: Option<u64>, state: NodeState) -> NodeRecord {
        let mut record = NodeRecord::pending(
            name,
            "10.0.0.1".parse().unwrap(),
            format!("{name}.example.com"),
            443,
            SshAccess::new(
                "root",
                22,
                SshCredential::Password {
                    password: Secret::new("pw"),
                },
            ),
        );
        record.state = state;
        record.control_plane_node_id = id;
        record
    }

    #[tokio::test]
    async fn splits_connected_from_the_rest() {
        let panel = MemoryPanel::new();
        let a = panel.preload("a", "10.0.0.1");
        let b = panel.preload("b", "10.0.0.2");
        panel.set_status("a", PanelNodeStatus::Connected);
        panel.set_status("b", PanelNodeStatus::Error);

        let records = vec![
            record("a", Some(a), NodeState::Active),
            record("b", Some(b), NodeState::Degraded),
            record("c", Some(99), NodeState::Active),
            record("d", None, NodeState::Pending),
        ];
        let report = check_health(&panel, &records).await.unwrap();

        assert_eq!(report.healthy, vec!["a".to_string()]);
        assert_eq!(
            report.unhealthy,
            vec![
                UnhealthyNode {
                    node: "b".to_string(),
                    status: "error".to_string()
                },
                UnhealthyNode {
                    node: "c".to_string(),
                    status: "not registered".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_panel_is_an_error() {
        let panel = MemoryPanel::new();
        let a = panel.preload("a", "10.0.0.1");
        panel.set_unreachable(true);

        let err = check_health(&panel, &[record("a", Some(a), NodeState::Active)])
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Unreachable { .. }));
    }
}
