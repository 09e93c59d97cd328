//! The `Fleet` facade: one handle over registry, remote executor, panel,
//! sync engine, provisioner and notifier.

use std::sync::Arc;

use relaygrid_balancer::{CommandControl, LocalControl, SyncEngine, SyncReport};
use relaygrid_core::{FleetConfig, FleetError, FleetResult};
use relaygrid_monitor::{
    FanoutNotifier, FleetMonitor, HealthReport, LogNotifier, Notifier, WebhookNotifier,
    check_health, report_sync,
};
use relaygrid_panel::{ControlPlane, PanelClient, PanelCredentials, PanelError};
use relaygrid_provision::{ProvisionReport, ProvisionRequest, Provisioner};
use relaygrid_registry::{NodeRecord, NodeState, Registry};
use relaygrid_remote::{
    NodeEndpoint, NodeLocks, RateLimiter, RemoteExecutor, RemoteShell, ServiceCommand, SshShell,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

/// Collaborators a `Fleet` is assembled from.
pub struct FleetParts {
    pub config: FleetConfig,
    pub registry: Registry,
    pub shell: Arc<dyn RemoteShell>,
    pub panel: Arc<dyn ControlPlane>,
    pub local: Arc<dyn LocalControl>,
    pub notifier: Arc<dyn Notifier>,
}

/// Result of `provision_node` / `resume_node`.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub provision: ProvisionReport,
    /// The follow-up sync that delivers the node's routing rule.
    pub sync: Option<SyncReport>,
    /// Why that sync did not run to completion.
    pub sync_error: Option<String>,
}

impl ProvisionOutcome {
    pub fn node(&self) -> &NodeRecord {
        &self.provision.node
    }
}

/// What `remove_node` managed to do. Control-plane deregistration and the
/// service stop are best effort; their failures are reported here rather
/// than aborting the removal.
#[derive(Debug, Clone, Serialize)]
pub struct RemovalReport {
    pub node: String,
    pub deregistered: bool,
    pub deregister_error: Option<String>,
    pub sync: SyncReport,
    pub service_stopped: bool,
    pub stop_error: Option<String>,
    /// Kept in the registry as `Removed` instead of deleted.
    pub retained: bool,
}

pub struct Fleet {
    config: FleetConfig,
    registry: Registry,
    executor: RemoteExecutor,
    panel: Arc<dyn ControlPlane>,
    engine: SyncEngine,
    provisioner: Provisioner,
    notifier: Arc<dyn Notifier>,
    locks: NodeLocks,
}

impl Fleet {
    /// Assemble the production stack: redb registry, ssh shell, HTTPS panel
    /// client and the local balancer commands from `config`.
    pub fn from_config(config: FleetConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.registry.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let registry = Registry::open(&config.registry.path)?;
        info!(path = %config.registry.path.display(), "registry opened");

        let password = config.panel.password.clone().ok_or_else(|| {
            anyhow::anyhow!("panel password not set (panel.password or RELAYGRID_PANEL_PASSWORD)")
        })?;
        let panel = PanelClient::new(
            &config.panel,
            PanelCredentials::new(config.panel.username.clone(), password),
            config.remote.retry_policy(),
        )?;

        let shell = SshShell::new(config.remote.connect_timeout(), config.remote.keepalive());
        let local = CommandControl::new(
            config.balancer.validate_command.clone(),
            config.balancer.reload_command.clone(),
        );

        let mut notifier = FanoutNotifier::new().with(Arc::new(LogNotifier));
        if let Some(url) = &config.notify.webhook_url {
            notifier = notifier.with(Arc::new(WebhookNotifier::new(url.clone())?));
            info!(%url, "webhook notifications enabled");
        }

        Ok(Self::from_parts(FleetParts {
            config,
            registry,
            shell: Arc::new(shell),
            panel: Arc::new(panel),
            local: Arc::new(local),
            notifier: Arc::new(notifier),
        })?)
    }

    /// Node locks live in `registry.lock_dir()`, so fleets built in other
    /// processes from the same config never write to one node at once.
    pub fn from_parts(parts: FleetParts) -> FleetResult<Self> {
        let FleetParts {
            config,
            registry,
            shell,
            panel,
            local,
            notifier,
        } = parts;

        let locks = NodeLocks::in_dir(config.registry.lock_dir())?;
        let executor = RemoteExecutor::new(
            shell,
            config.remote.retry_policy(),
            Arc::new(RateLimiter::new(config.remote.rate_limit())),
            config.remote.command_timeout(),
        );
        let engine = SyncEngine::new(
            executor.clone(),
            locks.clone(),
            local,
            config.balancer.clone(),
        );
        let provisioner = Provisioner::new(
            registry.clone(),
            executor.clone(),
            panel.clone(),
            locks.clone(),
            config.provision.clone(),
            config.balancer.default_backend_port,
        );

        Ok(Self {
            config,
            registry,
            executor,
            panel,
            engine,
            provisioner,
            notifier,
            locks,
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn locks(&self) -> &NodeLocks {
        &self.locks
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Onboard a node, then sync the fleet so its routing rule goes live.
    pub async fn provision_node(&self, request: ProvisionRequest) -> FleetResult<ProvisionOutcome> {
        let report = self.provisioner.provision(request).await?;
        Ok(self.after_provisioning(report).await)
    }

    /// Continue a failed or interrupted onboarding.
    pub async fn resume_node(&self, name: &str) -> FleetResult<ProvisionOutcome> {
        let report = self.provisioner.resume(name).await?;
        Ok(self.after_provisioning(report).await)
    }

    async fn after_provisioning(&self, provision: ProvisionReport) -> ProvisionOutcome {
        if !provision.is_deployed() {
            return ProvisionOutcome {
                provision,
                sync: None,
                sync_error: None,
            };
        }
        match self.sync_all(None).await {
            Ok(sync) => ProvisionOutcome {
                provision,
                sync: Some(sync),
                sync_error: None,
            },
            Err(e) => {
                warn!(node = %provision.node.name, error = %e, "node deployed but fleet sync failed");
                ProvisionOutcome {
                    provision,
                    sync: None,
                    sync_error: Some(e.to_string()),
                }
            }
        }
    }

    /// Take a node out of the fleet: deregister it, drop its rule
    /// everywhere, stop its service, then delete the record (or keep it
    /// as `Removed` when `retain` is set).
    pub async fn remove_node(&self, name: &str, retain: bool) -> FleetResult<RemovalReport> {
        let config_lock = self.engine.lock_config().await?;
        let guard = self.locks.lock(name).await?;
        let record = self.registry.require(name)?;
        if record.state.is_removed() {
            if retain {
                return Err(FleetError::Validation(format!("node {name} is already removed")));
            }
            // Retained earlier; the rule and the registration are already gone.
            self.registry.remove(name)?;
            drop(guard);
            drop(config_lock);
            self.locks.forget(name);
            return Ok(RemovalReport {
                node: name.to_string(),
                deregistered: true,
                deregister_error: None,
                sync: SyncReport::default(),
                service_stopped: false,
                stop_error: None,
                retained: false,
            });
        }
        info!(node = %name, retain, "removing node");

        let (deregistered, deregister_error) = match record.control_plane_node_id {
            None => (true, None),
            Some(id) => match self.panel.delete_node(id).await {
                Ok(()) | Err(PanelError::NotFound(_)) => (true, None),
                Err(e) => {
                    warn!(node = %name, error = %e, "control-plane deregistration failed");
                    (false, Some(e.to_string()))
                }
            },
        };

        let remaining: Vec<NodeRecord> = self
            .registry
            .list()?
            .into_iter()
            .filter(|r| r.name != name)
            .collect();
        let sync = self.engine.sync(&remaining, None).await?;
        report_sync(self.notifier.as_ref(), &sync).await;

        // Nothing was deployed before the panel assigned an id.
        let (service_stopped, stop_error) = if record.control_plane_node_id.is_none() {
            (false, None)
        } else {
            let endpoint = NodeEndpoint::from(&record);
            let service_dir = self.config.provision.service_dir.as_str();
            match self
                .executor
                .service(&endpoint, ServiceCommand::Stop, service_dir)
                .await
            {
                Ok(_) => (true, None),
                Err(e) => {
                    warn!(node = %name, error = %e, "could not stop node service");
                    (false, Some(e.to_string()))
                }
            }
        };

        if retain {
            self.registry.update(name, |r| {
                *r = r.transitioned(NodeState::Removed);
                r.control_plane_node_id = None;
            })?;
        } else {
            self.registry.remove(name)?;
        }
        drop(guard);
        drop(config_lock);
        self.locks.forget(name);
        info!(node = %name, deregistered, service_stopped, "node removed");

        Ok(RemovalReport {
            node: name.to_string(),
            deregistered,
            deregister_error,
            sync,
            service_stopped,
            stop_error,
            retained: retain,
        })
    }

    // ── Sync ──────────────────────────────────────────────────────

    /// Render from the registry, apply on the main server, then push to
    /// every serving node.
    pub async fn sync_all(&self, cancel: Option<watch::Receiver<bool>>) -> FleetResult<SyncReport> {
        let _config = self.engine.lock_config().await?;
        let records = self.registry.list()?;
        let report = self.engine.sync(&records, cancel).await?;
        report_sync(self.notifier.as_ref(), &report).await;
        Ok(report)
    }

    /// Bring one serving node in line with the main server's render.
    pub async fn sync_one(&self, name: &str) -> FleetResult<SyncReport> {
        let _config = self.engine.lock_config().await?;
        let records = self.registry.list()?;
        let record = records
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| FleetError::NotFound(format!("node {name}")))?;
        if !record.state.is_serving() {
            return Err(FleetError::Validation(format!(
                "node {name} is {}, only active or degraded nodes are synced",
                record.state
            )));
        }

        let text = self.engine.render(&records);
        self.engine.apply_locally(&text).await?;
        let report = self
            .engine
            .propagate(std::slice::from_ref(record), &text, None)
            .await;
        report_sync(self.notifier.as_ref(), &report).await;
        Ok(report)
    }

    // ── Inspection ────────────────────────────────────────────────

    pub async fn check_health(&self) -> FleetResult<HealthReport> {
        let records = self.registry.list()?;
        check_health(self.panel.as_ref(), &records).await
    }

    pub fn list(&self) -> FleetResult<Vec<NodeRecord>> {
        Ok(self.registry.list()?)
    }

    /// The config the main server and every node should carry.
    pub fn render(&self) -> FleetResult<String> {
        Ok(self.engine.render(&self.registry.list()?))
    }

    /// A monitor sharing this fleet's locks, so its repairs never overlap
    /// a sync of the same node, whichever process runs it.
    pub fn monitor(&self) -> FleetMonitor {
        FleetMonitor::new(
            self.registry.clone(),
            self.engine.clone(),
            self.executor.clone(),
            self.panel.clone(),
            self.notifier.clone(),
            self.locks.clone(),
            self.config.monitor.clone(),
            self.config.provision.service_dir.clone(),
        )
    }
}
