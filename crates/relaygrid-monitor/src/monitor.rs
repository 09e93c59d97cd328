//! The fleet monitor loop.
//!
//! `FleetMonitor::run` wakes every `interval`, runs one cycle and goes back
//! to sleep until the next tick or a shutdown signal. A cycle reads the
//! registry once and works from that snapshot; the drift pass holds the
//! fleet config lock, so it never races a CLI sync with an older render. The stop signal is checked
//! between nodes, never in the middle of one node's sync or restart.

use std::sync::Arc;

use relaygrid_balancer::{ConfigSnapshot, NodeFailure, SyncEngine, SyncReport};
use relaygrid_core::FleetResult;
use relaygrid_core::config::MonitorConfig;
use relaygrid_panel::ControlPlane;
use relaygrid_registry::{NodeRecord, NodeState, Registry};
use relaygrid_remote::{NodeEndpoint, NodeLocks, RemoteExecutor, ServiceCommand};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::health::{HealthReport, UnhealthyNode, probe};
use crate::notify::{FleetEvent, Notifier, report_sync};

const MAIN_SERVER: &str = "localhost";

/// What one cycle saw and did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Snapshot of the authoritative render.
    pub snapshot: Option<ConfigSnapshot>,
    /// The main server's live config was rewritten.
    pub local_resynced: bool,
    /// The main server rejected the authoritative render.
    pub local_error: Option<String>,
    pub in_sync: Vec<String>,
    pub drifted: Vec<String>,
    /// Outcomes of the per-node resyncs.
    pub sync: SyncReport,
    /// Nodes whose snapshot could not be read.
    pub unreachable: Vec<NodeFailure>,
    /// Health before any restart.
    pub health: HealthReport,
    /// The control plane could not be queried; health was skipped.
    pub health_error: Option<String>,
    pub restarted: Vec<String>,
    pub recovered: Vec<String>,
    /// Still unhealthy after a restart; marked `Degraded`.
    pub degraded: Vec<String>,
    /// The stop signal arrived mid-cycle.
    pub cancelled: bool,
}

impl CycleReport {
    /// Anything an operator has to look at.
    pub fn needs_attention(&self) -> bool {
        self.local_error.is_some()
            || self.health_error.is_some()
            || !self.degraded.is_empty()
            || !self.sync.unknown.is_empty()
            || !self.sync.failed.is_empty()
    }
}

/// Periodic drift and health reconciliation.
pub struct FleetMonitor {
    registry: Registry,
    engine: SyncEngine,
    executor: RemoteExecutor,
    panel: Arc<dyn ControlPlane>,
    notifier: Arc<dyn Notifier>,
    locks: NodeLocks,
    config: MonitorConfig,
    service_dir: String,
}

impl FleetMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Registry,
        engine: SyncEngine,
        executor: RemoteExecutor,
        panel: Arc<dyn ControlPlane>,
        notifier: Arc<dyn Notifier>,
        locks: NodeLocks,
        config: MonitorConfig,
        service_dir: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            engine,
            executor,
            panel,
            notifier,
            locks,
            config,
            service_dir: service_dir.into(),
        }
    }

    /// Run cycles until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval().as_secs(),
            recheck_delay_secs = self.config.recheck_delay().as_secs(),
            "fleet monitor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_cycle(Some(&shutdown)).await {
                Ok(report) if report.cancelled => break,
                Ok(_) => {}
                Err(e) => error!(error = %e, "monitor cycle failed"),
            }

            tokio::select! {
                _ = sleep(self.config.interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("fleet monitor stopped");
    }

    /// One drift pass followed by one health pass.
    pub async fn run_cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> FleetResult<CycleReport> {
        let stopping = || shutdown.is_some_and(|rx| *rx.borrow());
        let config_lock = self.engine.lock_config().await?;
        let records = self.registry.list()?;
        let serving: Vec<NodeRecord> = records
            .iter()
            .filter(|r| r.state.is_serving())
            .cloned()
            .collect();

        let text = self.engine.render(&records);
        let expected = self.engine.expected_snapshot(&records);
        let mut report = CycleReport {
            snapshot: Some(expected.clone()),
            ..CycleReport::default()
        };

        // ── Drift ─────────────────────────────────────────────────────

        if self.reconcile_local(&text, &expected, &mut report).await {
            for record in &serving {
                if stopping() {
                    report.cancelled = true;
                    return Ok(report);
                }
                self.reconcile_node(record, &text, &expected, &mut report).await;
            }
        }
        drop(config_lock);

        // ── Health ────────────────────────────────────────────────────

        if stopping() {
            report.cancelled = true;
            return Ok(report);
        }
        self.heal(&serving, &mut report, &stopping).await;

        info!(
            in_sync = report.in_sync.len(),
            drifted = report.drifted.len(),
            unreachable = report.unreachable.len(),
            healthy = report.health.healthy.len(),
            unhealthy = report.health.unhealthy.len(),
            recovered = report.recovered.len(),
            degraded = report.degraded.len(),
            "monitor cycle complete"
        );
        Ok(report)
    }

    /// Bring the main server back to the render. Returns false when the
    /// render was rejected, in which case no node may be resynced.
    async fn reconcile_local(&self, text: &str, expected: &ConfigSnapshot, report: &mut CycleReport) -> bool {
        let actual = match self.engine.local_snapshot().await {
            Ok(actual) => actual,
            Err(e) => {
                warn!(error = %e, "could not read main server config");
                None
            }
        };
        if actual.as_ref() == Some(expected) {
            return true;
        }

        self.notifier
            .notify(&FleetEvent::LocalDrift {
                expected: expected.to_string(),
                actual: actual.map(|s| s.to_string()),
            })
            .await;
        match self.engine.apply_locally(text).await {
            Ok(_) => {
                report.local_resynced = true;
                true
            }
            Err(e) => {
                let reason = e.to_string();
                self.notifier
                    .notify(&FleetEvent::ManualAttention {
                        node: MAIN_SERVER.to_string(),
                        reason: reason.clone(),
                    })
                    .await;
                report.local_error = Some(reason);
                false
            }
        }
    }

    async fn reconcile_node(
        &self,
        record: &NodeRecord,
        text: &str,
        expected: &ConfigSnapshot,
        report: &mut CycleReport,
    ) {
        let endpoint = NodeEndpoint::from(record);
        let actual = match self.engine.remote_snapshot(&endpoint).await {
            Ok(actual) => actual,
            Err(e) => {
                let reason = e.to_string();
                self.notifier
                    .notify(&FleetEvent::Unreachable {
                        node: record.name.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                report.unreachable.push(NodeFailure {
                    node: record.name.clone(),
                    reason,
                });
                return;
            }
        };

        if actual.as_ref() == Some(expected) {
            debug!(node = %record.name, "config in sync");
            report.in_sync.push(record.name.clone());
            return;
        }

        report.drifted.push(record.name.clone());
        self.notifier
            .notify(&FleetEvent::Drift {
                node: record.name.clone(),
                expected: expected.to_string(),
                actual: actual.map(|s| s.to_string()),
            })
            .await;

        let outcome = self
            .engine
            .propagate(std::slice::from_ref(record), text, None)
            .await;
        report_sync(self.notifier.as_ref(), &outcome).await;
        report.sync.merge(outcome);
    }

    async fn heal(&self, serving: &[NodeRecord], report: &mut CycleReport, stopping: &impl Fn() -> bool) {
        let mut unhealthy: Vec<(&NodeRecord, u64)> = Vec::new();

        for record in serving {
            let Some(id) = record.control_plane_node_id else {
                continue;
            };
            if stopping() {
                report.cancelled = true;
                return;
            }
            match probe(self.panel.as_ref(), id).await {
                Ok(None) => {
                    report.health.healthy.push(record.name.clone());
                    if record.state == NodeState::Degraded {
                        self.recover(&record.name, report).await;
                    }
                }
                Ok(Some(status)) => {
                    self.notifier
                        .notify(&FleetEvent::Unhealthy {
                            node: record.name.clone(),
                            status: status.clone(),
                        })
                        .await;
                    report.health.unhealthy.push(UnhealthyNode {
                        node: record.name.clone(),
                        status,
                    });
                    unhealthy.push((record, id));
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.notifier
                        .notify(&FleetEvent::ControlPlaneUnreachable {
                            reason: reason.clone(),
                        })
                        .await;
                    report.health_error = Some(reason);
                    return;
                }
            }
        }

        if unhealthy.is_empty() {
            return;
        }

        let mut restart_errors = Vec::with_capacity(unhealthy.len());
        for (record, _) in &unhealthy {
            if stopping() {
                report.cancelled = true;
                return;
            }
            restart_errors.push(self.restart(record, report).await);
        }

        debug!(
            nodes = unhealthy.len(),
            delay_secs = self.config.recheck_delay().as_secs(),
            "waiting before health re-check"
        );
        sleep(self.config.recheck_delay()).await;

        for ((record, id), restart_error) in unhealthy.into_iter().zip(restart_errors) {
            if stopping() {
                report.cancelled = true;
                return;
            }
            match probe(self.panel.as_ref(), id).await {
                Ok(None) => {
                    info!(node = %record.name, "node healthy after restart");
                    if record.state == NodeState::Degraded {
                        self.recover(&record.name, report).await;
                    } else {
                        report.recovered.push(record.name.clone());
                        self.notifier
                            .notify(&FleetEvent::Recovered {
                                node: record.name.clone(),
                            })
                            .await;
                    }
                }
                Ok(Some(status)) => {
                    let reason = match restart_error {
                        Some(e) => format!("still {status} after failed restart: {e}"),
                        None => format!("still {status} after restart"),
                    };
                    self.degrade(&record.name, &reason, report).await;
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.notifier
                        .notify(&FleetEvent::ControlPlaneUnreachable {
                            reason: reason.clone(),
                        })
                        .await;
                    report.health_error = Some(reason);
                    return;
                }
            }
        }
    }

    /// One service restart under the node's lock. Returns the error, if any.
    async fn restart(&self, record: &NodeRecord, report: &mut CycleReport) -> Option<String> {
        let endpoint = NodeEndpoint::from(record);
        let outcome = match self.locks.lock(&record.name).await {
            Ok(_guard) => {
                self.executor
                    .service(&endpoint, ServiceCommand::Restart, &self.service_dir)
                    .await
            }
            Err(e) => Err(e),
        };
        match outcome {
            Ok(_) => {
                report.restarted.push(record.name.clone());
                self.notifier
                    .notify(&FleetEvent::Restarted {
                        node: record.name.clone(),
                    })
                    .await;
                None
            }
            Err(e) => {
                warn!(node = %record.name, error = %e, "service restart failed");
                if e.is_unreachable() {
                    self.notifier
                        .notify(&FleetEvent::Unreachable {
                            node: record.name.clone(),
                            reason: e.to_string(),
                        })
                        .await;
                }
                Some(e.to_string())
            }
        }
    }

    async fn recover(&self, name: &str, report: &mut CycleReport) {
        match self.registry.transition(name, NodeState::Active) {
            Ok(_) => {
                info!(node = %name, "degraded node promoted back to active");
                report.recovered.push(name.to_string());
                self.notifier
                    .notify(&FleetEvent::Recovered {
                        node: name.to_string(),
                    })
                    .await;
            }
            Err(e) => warn!(node = %name, error = %e, "could not mark node active"),
        }
    }

    async fn degrade(&self, name: &str, reason: &str, report: &mut CycleReport) {
        let marked = self.registry.update(name, |record| {
            record.state = NodeState::Degraded;
            record.last_error = Some(reason.to_string());
        });
        if let Err(e) = marked {
            warn!(node = %name, error = %e, "could not mark node degraded");
        }
        error!(node = %name, %reason, "node requires manual attention");
        report.degraded.push(name.to_string());
        self.notifier
            .notify(&FleetEvent::ManualAttention {
                node: name.to_string(),
                reason: reason.to_string(),
            })
            .await;
    }
}
