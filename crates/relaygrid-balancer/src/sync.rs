//! Fleet propagation with per-node rollback.
//!
//! Per node, under the node's lock:
//!
//! 1. rollback point: `cp -p <live> <live>.rollback-<unix millis>`
//! 2. upload the new config to `<live>.relaygrid-new`
//! 3. validate the staged file with the node's own validator
//! 4. move it over the live file and reload
//!
//! A failure in 2-4 restores the rollback point and reloads. If the
//! restore fails too, the node's state is unknown and is escalated.

use std::path::Path;
use std::sync::Arc;

use relaygrid_core::config::BalancerConfig;
use relaygrid_core::{FleetResult, epoch_millis};
use relaygrid_registry::NodeRecord;
use relaygrid_remote::shell::shell_quote;
use relaygrid_remote::{NodeEndpoint, NodeGuard, NodeLocks, RemoteError, RemoteExecutor};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::local::{LocalControl, apply_locally};
use crate::render::{MainServer, render_config};
use crate::report::{NodeOutcome, SyncReport};
use crate::snapshot::{ConfigSnapshot, snapshot};

const STAGED_SUFFIX: &str = ".relaygrid-new";

/// Lock serializing whole sync passes. The dot keeps it out of the node
/// name space.
const CONFIG_LOCK: &str = "fleet.config";

/// Where a node's previous config was saved.
#[derive(Debug, Clone)]
enum RollbackPoint {
    Saved(String),
    /// There was no live config; restoring means removing the new one.
    Absent,
}

/// Renders the config, applies it on the main server and propagates it to
/// serving nodes.
#[derive(Clone)]
pub struct SyncEngine {
    executor: RemoteExecutor,
    locks: NodeLocks,
    local: Arc<dyn LocalControl>,
    config: BalancerConfig,
}

impl SyncEngine {
    pub fn new(
        executor: RemoteExecutor,
        locks: NodeLocks,
        local: Arc<dyn LocalControl>,
        config: BalancerConfig,
    ) -> Self {
        Self {
            executor,
            locks,
            local,
            config,
        }
    }

    /// Held for a whole pass, from reading the registry to the last node,
    /// so a pass never pushes a render older than one already pushed. Take
    /// it before any node lock.
    pub async fn lock_config(&self) -> FleetResult<NodeGuard> {
        Ok(self.locks.lock(CONFIG_LOCK).await?)
    }

    pub fn render(&self, records: &[NodeRecord]) -> String {
        render_config(&MainServer::from_config(&self.config), records)
    }

    /// Snapshot of what the config should be for `records`.
    pub fn expected_snapshot(&self, records: &[NodeRecord]) -> ConfigSnapshot {
        snapshot(&self.render(records))
    }

    /// Apply `text` on the main server only.
    pub async fn apply_locally(&self, text: &str) -> FleetResult<ConfigSnapshot> {
        apply_locally(&self.config.config_path, text, self.local.as_ref()).await
    }

    /// Full pass: render from `records`, apply locally, then propagate to
    /// every serving record. A locally rejected config is returned as an
    /// error and no node is touched. Callers hold [`Self::lock_config`].
    pub async fn sync(
        &self,
        records: &[NodeRecord],
        cancel: Option<watch::Receiver<bool>>,
    ) -> FleetResult<SyncReport> {
        let text = self.render(records);
        self.apply_locally(&text).await?;

        let targets: Vec<NodeRecord> = records
            .iter()
            .filter(|r| r.state.is_serving())
            .cloned()
            .collect();
        Ok(self.propagate(&targets, &text, cancel).await)
    }

    /// Push `text` to `nodes`. Continues past per-node failures.
    pub async fn propagate(
        &self,
        nodes: &[NodeRecord],
        text: &str,
        cancel: Option<watch::Receiver<bool>>,
    ) -> SyncReport {
        let snap = snapshot(text);
        let text: Arc<str> = Arc::from(text);
        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        let mut launched = vec![false; nodes.len()];
        let mut outcomes: Vec<Option<NodeOutcome>> = vec![None; nodes.len()];

        info!(nodes = nodes.len(), snapshot = %snap.short(), "propagating config");

        for (index, record) in nodes.iter().enumerate() {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                debug!(node = %record.name, "sync cancelled, node skipped");
                continue;
            }

            let engine = self.clone();
            let endpoint = NodeEndpoint::from(record);
            let text = text.clone();
            tasks.spawn(async move {
                let outcome = engine.propagate_one(&endpoint, &text).await;
                drop(permit);
                (index, outcome)
            });
            launched[index] = true;
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!(error = %e, "sync task aborted"),
            }
        }

        for (index, outcome) in outcomes.iter_mut().enumerate() {
            if outcome.is_none() && launched[index] {
                *outcome = Some(NodeOutcome::Unknown {
                    reason: "sync task aborted".to_string(),
                });
            }
        }

        let mut report = SyncReport {
            snapshot: Some(snap),
            ..SyncReport::default()
        };
        for (record, outcome) in nodes.iter().zip(outcomes) {
            report.record(&record.name, outcome.unwrap_or(NodeOutcome::Skipped));
        }

        let counts = report.counts();
        info!(
            applied = counts.applied,
            rolled_back = counts.rolled_back,
            unreachable = counts.unreachable,
            failed = report.failed.len(),
            unknown = report.unknown.len(),
            skipped = report.skipped.len(),
            "propagation complete"
        );
        for failure in &report.unknown {
            error!(node = %failure.node, reason = %failure.reason, "node config state unknown, manual attention required");
        }
        report
    }

    /// Hash of the node's live config; `None` when it has none.
    pub async fn remote_snapshot(&self, node: &NodeEndpoint) -> FleetResult<Option<ConfigSnapshot>> {
        Ok(self
            .executor
            .file_digest(node, &self.config.remote_config_path)
            .await?
            .map(ConfigSnapshot::from_hex))
    }

    async fn propagate_one(&self, node: &NodeEndpoint, text: &str) -> NodeOutcome {
        let _guard = match self.locks.lock(&node.name).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(node = %node.name, error = %e, "could not lock node, not changed");
                return NodeOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };
        let live = self.config.remote_config_path.as_str();

        let point = match self.create_rollback_point(node, live).await {
            Ok(point) => point,
            Err(e) if e.is_unreachable() => {
                warn!(node = %node.name, error = %e, "node unreachable, not changed");
                return NodeOutcome::Unreachable {
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                warn!(node = %node.name, error = %e, "could not create rollback point, not changed");
                return NodeOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        match self.install(node, live, text).await {
            Ok(()) => {
                if let RollbackPoint::Saved(backup) = &point {
                    self.discard(node, backup).await;
                }
                debug!(node = %node.name, "config applied");
                NodeOutcome::Applied
            }
            Err(e) => {
                warn!(node = %node.name, error = %e, "config update failed, rolling back");
                match self.restore(node, live, &point).await {
                    Ok(()) => NodeOutcome::RolledBack {
                        reason: e.to_string(),
                    },
                    Err(restore) => {
                        error!(node = %node.name, error = %restore, "rollback failed");
                        NodeOutcome::Unknown {
                            reason: format!("{e}; rollback failed: {restore}"),
                        }
                    }
                }
            }
        }
    }

    async fn create_rollback_point(
        &self,
        node: &NodeEndpoint,
        live: &str,
    ) -> Result<RollbackPoint, RemoteError> {
        if !self.executor.file_exists(node, live).await? {
            return Ok(RollbackPoint::Absent);
        }
        let backup = format!("{live}.rollback-{}", epoch_millis());
        self.executor
            .run(
                node,
                &format!("cp -p {} {}", shell_quote(live), shell_quote(&backup)),
            )
            .await?;
        Ok(RollbackPoint::Saved(backup))
    }

    async fn install(&self, node: &NodeEndpoint, live: &str, text: &str) -> Result<(), RemoteError> {
        let staged = format!("{live}{STAGED_SUFFIX}");
        self.executor
            .write_file(node, &staged, text.as_bytes(), Some(0o644))
            .await?;
        self.executor
            .run(
                node,
                &format!("{} {}", self.config.validate_command, shell_quote(&staged)),
            )
            .await?;
        self.executor
            .run(
                node,
                &format!("mv -f {} {}", shell_quote(&staged), shell_quote(live)),
            )
            .await?;
        self.executor.run(node, &self.config.reload_command).await?;
        Ok(())
    }

    async fn restore(
        &self,
        node: &NodeEndpoint,
        live: &str,
        point: &RollbackPoint,
    ) -> Result<(), RemoteError> {
        let staged = shell_quote(&format!("{live}{STAGED_SUFFIX}"));
        match point {
            RollbackPoint::Saved(backup) => {
                let backup = shell_quote(backup);
                self.executor
                    .run(
                        node,
                        &format!(
                            "cp -p {backup} {} && rm -f {staged} {backup}",
                            shell_quote(live)
                        ),
                    )
                    .await?;
                self.executor.run(node, &self.config.reload_command).await?;
            }
            RollbackPoint::Absent => {
                self.executor
                    .run(node, &format!("rm -f {staged} {}", shell_quote(live)))
                    .await?;
            }
        }
        info!(node = %node.name, "previous config restored");
        Ok(())
    }

    /// Remove a rollback point that is no longer needed. Best effort.
    async fn discard(&self, node: &NodeEndpoint, backup: &str) {
        if let Err(e) = self
            .executor
            .run(node, &format!("rm -f {}", shell_quote(backup)))
            .await
        {
            debug!(node = %node.name, error = %e, "could not remove rollback point");
        }
    }

    pub fn live_path(&self) -> &Path {
        &self.config.config_path
    }

    /// Hash of the main server's live config; `None` when it has none.
    pub async fn local_snapshot(&self) -> FleetResult<Option<ConfigSnapshot>> {
        match tokio::fs::read(self.live_path()).await {
            Ok(bytes) => Ok(Some(snapshot(&String::from_utf8_lossy(&bytes)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryControl;
    use relaygrid_core::{RetryPolicy, Secret};
    use relaygrid_registry::{NodeState, SshAccess, SshCredential};
    use relaygrid_remote::{MemoryShell, RateLimiter};
    use std::time::Duration;

    const LIVE: &str = "/etc/haproxy/haproxy.cfg";

    struct Harness {
        _dir: tempfile::TempDir,
        shell: Arc<MemoryShell>,
        control: Arc<MemoryControl>,
        engine: SyncEngine,
    }

    fn harness_with(control: MemoryControl, max_parallel: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let shell = Arc::new(MemoryShell::new());
        let control = Arc::new(control);
        let executor = RemoteExecutor::new(
            shell.clone(),
            RetryPolicy::new(3, Duration::from_millis(1)),
            Arc::new(RateLimiter::unlimited()),
            Duration::from_secs(5),
        );
        let config = BalancerConfig {
            config_path: dir.path().join("haproxy.cfg"),
            max_parallel,
            ..BalancerConfig::default()
        };
        let engine = SyncEngine::new(executor, NodeLocks::new(), control.clone(), config);
        Harness {
            _dir: dir,
            shell,
            control,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(MemoryControl::new(), 1)
    }

    fn node(name: &str, last_octet: u8) -> NodeRecord {
        let mut record = NodeRecord::pending(
            name,
            format!("10.0.0.{last_octet}").parse().unwrap(),
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
        record.state = NodeState::Active;
        record.control_plane_node_id = Some(u64::from(last_octet));
        record
    }

    fn fleet(h: &Harness, names: &[&str]) -> Vec<NodeRecord> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                h.shell.put_file(name, LIVE, b"old config\n");
                node(name, i as u8 + 1)
            })
            .collect()
    }

    fn no_rollback_points(h: &Harness, name: &str) -> bool {
        h.shell
            .paths(name)
            .iter()
            .all(|p| !p.contains(".rollback-") && !p.ends_with(STAGED_SUFFIX))
    }

    #[tokio::test]
    async fn healthy_fleet_converges() {
        let h = harness();
        let records = fleet(&h, &["a", "b", "c"]);

        let report = h.engine.sync(&records, None).await.unwrap();

        assert_eq!(report.applied, vec!["a", "b", "c"]);
        assert!(report.is_clean());
        let expected = h.engine.render(&records);
        assert_eq!(
            std::fs::read_to_string(h.engine.live_path()).unwrap(),
            expected
        );
        for name in ["a", "b", "c"] {
            assert_eq!(h.shell.file_string(name, LIVE).unwrap(), expected);
            assert_eq!(h.shell.reloads(name), 1);
            assert!(no_rollback_points(&h, name));
        }
    }

    #[tokio::test]
    async fn failed_transfer_rolls_back_only_that_node() {
        let h = harness();
        let records = fleet(&h, &["a", "b", "c"]);
        h.shell.fail_uploads("b", true);

        let report = h.engine.sync(&records, None).await.unwrap();

        assert_eq!(report.applied, vec!["a", "c"]);
        assert_eq!(report.rolled_back.len(), 1);
        assert_eq!(report.rolled_back[0].node, "b");
        assert_eq!(h.shell.file_string("b", LIVE).unwrap(), "old config\n");
        assert!(no_rollback_points(&h, "b"));
        let counts = report.counts();
        assert_eq!((counts.applied, counts.rolled_back, counts.unreachable), (2, 1, 0));
    }

    #[tokio::test]
    async fn remote_validation_failure_restores_previous_config() {
        let h = harness();
        let records = fleet(&h, &["a"]);
        h.shell.reject_config_containing("a", "node_a");

        let report = h.engine.sync(&records, None).await.unwrap();

        assert_eq!(report.rolled_back.len(), 1);
        assert_eq!(h.shell.file_string("a", LIVE).unwrap(), "old config\n");
        // Restore reloads once; the failed update never reached reload.
        assert_eq!(h.shell.reloads("a"), 1);
    }

    #[tokio::test]
    async fn persistent_reload_failure_is_unknown() {
        let h = harness();
        let records = fleet(&h, &["a"]);
        // Fails the update's reload and the restore's reload alike.
        h.shell.fail_on("a", "systemctl reload");

        let report = h.engine.sync(&records, None).await.unwrap();

        assert!(report.has_unknown());
        assert_eq!(h.shell.file_string("a", LIVE).unwrap(), "old config\n");
    }

    #[tokio::test]
    async fn failed_restore_is_unknown_and_escalated() {
        let h = harness();
        let records = fleet(&h, &["a", "b"]);
        h.shell.fail_uploads("a", true);
        h.shell.fail_on("a", &format!("cp -p {LIVE}.rollback-"));

        let report = h.engine.sync(&records, None).await.unwrap();

        assert_eq!(report.unknown.len(), 1);
        assert_eq!(report.unknown[0].node, "a");
        assert_eq!(report.applied, vec!["b"]);
        assert!(report.escalations()[0].needs_escalation());
    }

    #[tokio::test]
    async fn unreachable_node_is_reported_and_untouched() {
        let h = harness();
        let records = fleet(&h, &["a", "b"]);
        h.shell.set_unreachable("a", true);

        let report = h.engine.sync(&records, None).await.unwrap();

        assert_eq!(report.unreachable.len(), 1);
        assert_eq!(report.unreachable[0].node, "a");
        assert_eq!(report.applied, vec!["b"]);
        assert_eq!(h.shell.file_string("a", LIVE).unwrap(), "old config\n");
    }

    #[tokio::test]
    async fn node_lost_mid_update_without_restore_is_unknown() {
        let h = harness();
        let records = fleet(&h, &["a"]);
        // test -f and cp succeed, then the node disappears.
        h.shell.go_offline_after("a", 2);

        let report = h.engine.sync(&records, None).await.unwrap();
        assert_eq!(report.unknown.len(), 1);
    }

    #[tokio::test]
    async fn rollback_point_failure_leaves_node_untouched() {
        let h = harness();
        let records = fleet(&h, &["a"]);
        h.shell.fail_on("a", &format!("cp -p {LIVE} "));

        let report = h.engine.sync(&records, None).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(h.shell.reloads("a"), 0);
        assert_eq!(h.shell.file_string("a", LIVE).unwrap(), "old config\n");
    }

    #[tokio::test]
    async fn local_rejection_touches_no_node() {
        let control = MemoryControl::new();
        control.reject_containing("node_a");
        let h = harness_with(control, 1);
        let records = fleet(&h, &["a", "b"]);

        let err = h.engine.sync(&records, None).await.unwrap_err();

        assert!(matches!(err, relaygrid_core::FleetError::ConfigValidation(_)));
        for name in ["a", "b"] {
            assert!(h.shell.commands(name).is_empty());
        }
        assert_eq!(h.control.reloads(), 0);
    }

    #[tokio::test]
    async fn local_snapshot_tracks_live_file() {
        let h = harness();
        let records = fleet(&h, &["a"]);
        assert_eq!(h.engine.local_snapshot().await.unwrap(), None);

        h.engine.sync(&records, None).await.unwrap();

        assert_eq!(
            h.engine.local_snapshot().await.unwrap(),
            Some(h.engine.expected_snapshot(&records))
        );
    }

    #[tokio::test]
    async fn node_without_live_config_gets_one() {
        let h = harness();
        let records = vec![node("fresh", 9)];

        let report = h.engine.sync(&records, None).await.unwrap();
        assert_eq!(report.applied, vec!["fresh"]);
        assert!(h.shell.file("fresh", LIVE).is_some());
    }

    #[tokio::test]
    async fn only_serving_nodes_are_targeted() {
        let h = harness();
        let mut records = fleet(&h, &["a", "b"]);
        records[1].state = NodeState::Failed;

        let report = h.engine.sync(&records, None).await.unwrap();
        assert_eq!(report.total(), 1);
        assert!(h.shell.commands("b").is_empty());
        // The failed node is still routed.
        assert!(h.engine.render(&records).contains("b.example.com"));
    }

    #[tokio::test]
    async fn cancelled_sync_skips_unstarted_nodes() {
        let h = harness();
        let records = fleet(&h, &["a", "b"]);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = h.engine.propagate(&records, "text", Some(rx)).await;
        assert_eq!(report.skipped, vec!["a", "b"]);
        assert!(h.shell.commands("a").is_empty());
    }

    #[tokio::test]
    async fn parallel_sync_reports_in_registry_order() {
        let h = harness_with(MemoryControl::new(), 4);
        let records = fleet(&h, &["a", "b", "c", "d", "e"]);
        h.shell.set_unreachable("c", true);

        let report = h.engine.sync(&records, None).await.unwrap();
        assert_eq!(report.applied, vec!["a", "b", "d", "e"]);
        assert_eq!(report.unreachable[0].node, "c");
    }

    #[tokio::test]
    async fn remote_snapshot_matches_rendered_snapshot() {
        let h = harness();
        let records = fleet(&h, &["a"]);
        let endpoint = NodeEndpoint::from(&records[0]);

        let before = h.engine.remote_snapshot(&endpoint).await.unwrap().unwrap();
        assert_ne!(before, h.engine.expected_snapshot(&records));

        h.engine.sync(&records, None).await.unwrap();
        let after = h.engine.remote_snapshot(&endpoint).await.unwrap().unwrap();
        assert_eq!(after, h.engine.expected_snapshot(&records));

        let missing = NodeEndpoint::from(&node("none", 7));
        assert_eq!(h.engine.remote_snapshot(&missing).await.unwrap(), None);
    }
}
