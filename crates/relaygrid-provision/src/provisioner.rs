//! Provisioner: drives one node from `Pending` to `Active`.

use std::sync::Arc;

use relaygrid_core::config::ProvisionConfig;
use relaygrid_core::{FleetError, FleetResult, PollError, Probe, poll_until};
use relaygrid_panel::{ControlPlane, NewNode};
use relaygrid_registry::{NodeRecord, NodeState, Registry, SshAccess, WriteMode};
use relaygrid_remote::{NodeEndpoint, NodeLocks, RemoteExecutor, ServiceCommand};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::env::render_env;
use crate::validate::validate_identity;

/// Permissions of the delivered client certificate.
const CERT_MODE: u32 = 0o600;
const ENV_MODE: u32 = 0o644;

/// Onboarding input, unvalidated.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: String,
    pub address: String,
    pub domain: String,
    pub ssh: SshAccess,
    /// Port the load balancer forwards to; the configured default if unset.
    pub backend_port: Option<u16>,
}

/// What a provisioning run did.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub node: NodeRecord,
    /// States entered during this run, in order.
    pub visited: Vec<NodeState>,
}

impl ProvisionReport {
    pub fn final_state(&self) -> NodeState {
        self.node.state
    }

    /// Deployed, whether or not health was confirmed.
    pub fn is_deployed(&self) -> bool {
        self.node.state.is_serving()
    }
}

pub struct Provisioner {
    registry: Registry,
    executor: RemoteExecutor,
    panel: Arc<dyn ControlPlane>,
    locks: NodeLocks,
    config: ProvisionConfig,
    default_backend_port: u16,
}

/// Run state threaded through the steps.
struct Run {
    record: NodeRecord,
    visited: Vec<NodeState>,
}

impl Provisioner {
    pub fn new(
        registry: Registry,
        executor: RemoteExecutor,
        panel: Arc<dyn ControlPlane>,
        locks: NodeLocks,
        config: ProvisionConfig,
        default_backend_port: u16,
    ) -> Self {
        Self {
            registry,
            executor,
            panel,
            locks,
            config,
            default_backend_port,
        }
    }

    /// Onboard a new node. Validation errors leave no trace; any later
    /// failure leaves the record in `Failed` with the reason recorded.
    pub async fn provision(&self, request: ProvisionRequest) -> FleetResult<ProvisionReport> {
        let _guard = self.locks.lock(&request.name).await?;

        let address =
            validate_identity(&self.registry, &request.name, &request.address, &request.domain)?;
        let record = NodeRecord::pending(
            request.name.clone(),
            address,
            request.domain.to_ascii_lowercase(),
            request.backend_port.unwrap_or(self.default_backend_port),
            request.ssh,
        );
        let record = self.registry.upsert(&record, WriteMode::Create)?;
        info!(node = %record.name, address = %record.address, domain = %record.domain, "provisioning node");

        let mut run = Run {
            record,
            visited: vec![NodeState::Pending],
        };
        self.enter(&mut run, NodeState::Registering)?;
        self.drive(run).await
    }

    /// Continue an interrupted or failed run from the earliest step it has
    /// not completed.
    pub async fn resume(&self, name: &str) -> FleetResult<ProvisionReport> {
        let _guard = self.locks.lock(name).await?;
        let record = self.registry.require(name)?;

        let restart_at = match (record.state, record.control_plane_node_id) {
            (NodeState::Active, _) => {
                return Err(FleetError::Validation(format!("node {name} is already active")));
            }
            (NodeState::Removed, _) => {
                return Err(FleetError::Validation(format!("node {name} has been removed")));
            }
            // Deployed but unconfirmed: only verification is left.
            (NodeState::Degraded, _) => NodeState::Deploying,
            (_, Some(_)) => NodeState::AwaitingCertificate,
            (_, None) => NodeState::Registering,
        };
        info!(node = %name, from = %record.state, to = %restart_at, "resuming provisioning");

        let mut run = Run {
            visited: vec![record.state],
            record,
        };
        if run.record.state != restart_at {
            self.enter(&mut run, restart_at)?;
        }
        self.drive(run).await
    }

    /// Step until a terminal state. Failures are persisted on the record.
    async fn drive(&self, mut run: Run) -> FleetResult<ProvisionReport> {
        loop {
            let step = match run.record.state {
                NodeState::Registering => self.register(&mut run).await,
                NodeState::AwaitingCertificate => self.deliver_certificate(&mut run).await,
                NodeState::Deploying => self.verify(&mut run).await,
                NodeState::Active | NodeState::Degraded => {
                    return Ok(ProvisionReport {
                        node: run.record,
                        visited: run.visited,
                    });
                }
                state => Err(FleetError::Validation(format!(
                    "cannot provision from state {state}"
                ))),
            };
            if let Err(err) = step {
                return Err(self.fail(&mut run, err));
            }
        }
    }

    /// Registering → AwaitingCertificate.
    async fn register(&self, run: &mut Run) -> FleetResult<()> {
        self.panel.authenticate().await?;
        let id = self
            .panel
            .add_node(&NewNode {
                name: run.record.name.clone(),
                address: run.record.address.to_string(),
                port: self.config.service_port,
                api_port: self.config.api_port,
            })
            .await?;

        run.record = self.registry.update(&run.record.name, |r| {
            r.control_plane_node_id = Some(id);
            r.state = NodeState::AwaitingCertificate;
        })?;
        run.visited.push(NodeState::AwaitingCertificate);
        info!(node = %run.record.name, id, "registered with control plane");
        Ok(())
    }

    /// AwaitingCertificate → Deploying: fetch the certificate, install it
    /// with the service environment, restart the service.
    async fn deliver_certificate(&self, run: &mut Run) -> FleetResult<()> {
        let id = node_id(&run.record)?;
        let name = run.record.name.clone();
        let panel = &self.panel;

        let certificate = poll_until(&self.config.cert_poll(), "certificate", |_| async move {
            let node = panel.get_node(id).await?;
            Ok::<_, FleetError>(match node.certificate() {
                Some(pem) => Probe::Ready(pem.to_string()),
                None => Probe::NotYet,
            })
        })
        .await
        .map_err(|e| match e {
            PollError::TimedOut { attempts } => FleetError::CertificateTimeout {
                node: name.clone(),
                attempts,
            },
            PollError::Failed(e) => e,
        })?;
        debug!(node = %name, bytes = certificate.len(), "certificate issued");

        self.enter(run, NodeState::Deploying)?;

        let endpoint = NodeEndpoint::from(&run.record);
        self.executor
            .write_file(
                &endpoint,
                &self.config.cert_path,
                certificate.as_bytes(),
                Some(CERT_MODE),
            )
            .await?;
        self.executor
            .write_file(
                &endpoint,
                &self.config.env_path,
                render_env(&self.config).as_bytes(),
                Some(ENV_MODE),
            )
            .await?;
        self.executor
            .service(&endpoint, ServiceCommand::Restart, &self.config.service_dir)
            .await?;
        info!(node = %name, "certificate deployed, service restarted");
        Ok(())
    }

    /// Deploying → Active, or Degraded when health is not confirmed in time.
    async fn verify(&self, run: &mut Run) -> FleetResult<()> {
        let id = node_id(&run.record)?;
        let endpoint = NodeEndpoint::from(&run.record);
        let port = self.config.service_port;
        let executor = &self.executor;
        let panel = &self.panel;
        let endpoint_ref = &endpoint;

        let verified = poll_until(&self.config.verify_poll(), "verify node", |_| async move {
            let listening = match executor.run(endpoint_ref, "ss -ltn").await {
                Ok(out) => port_listening(&out.stdout, port),
                Err(e) => {
                    debug!(node = %endpoint_ref.name, error = %e, "listen check failed");
                    false
                }
            };
            let connected = match panel.get_node(id).await {
                Ok(node) => node.is_connected(),
                Err(e) => {
                    debug!(node = %endpoint_ref.name, error = %e, "status check failed");
                    false
                }
            };
            Ok::<_, FleetError>(if listening && connected {
                Probe::Ready(())
            } else {
                Probe::NotYet
            })
        })
        .await;

        match verified {
            Ok(()) => {
                self.enter(run, NodeState::Active)?;
                info!(node = %run.record.name, "node active");
            }
            Err(e) => {
                let reason = format!("health not confirmed: {e}");
                warn!(node = %run.record.name, %reason, "node degraded");
                run.record = self.registry.update(&run.record.name, |r| {
                    r.state = NodeState::Degraded;
                    r.last_error = Some(reason.clone());
                })?;
                run.visited.push(NodeState::Degraded);
            }
        }
        Ok(())
    }

    /// Persist a transition.
    fn enter(&self, run: &mut Run, state: NodeState) -> FleetResult<()> {
        run.record = self.registry.transition(&run.record.name, state)?;
        run.visited.push(state);
        debug!(node = %run.record.name, %state, "state persisted");
        Ok(())
    }

    /// Record the failure; the control-plane id is kept for `resume`.
    fn fail(&self, run: &mut Run, err: FleetError) -> FleetError {
        warn!(node = %run.record.name, state = %run.record.state, error = %err, "provisioning failed");
        let reason = err.to_string();
        match self.registry.update(&run.record.name, |r| {
            r.state = NodeState::Failed;
            r.last_error = Some(reason.clone());
        }) {
            Ok(record) => {
                run.record = record;
                run.visited.push(NodeState::Failed);
            }
            Err(persist) => {
                warn!(node = %run.record.name, error = %persist, "could not persist failure");
            }
        }
        err
    }
}

fn node_id(record: &NodeRecord) -> FleetResult<u64> {
    record.control_plane_node_id.ok_or_else(|| {
        FleetError::Validation(format!("node {} has no control-plane id", record.name))
    })
}

/// Whether `ss -ltn` output shows a listener on `port`.
pub(crate) fn port_listening(ss_output: &str, port: u16) -> bool {
    let suffix = format!(":{port}");
    ss_output.lines().any(|line| {
        line.starts_with("LISTEN")
            && line
                .split_whitespace()
                .any(|field| field.ends_with(&suffix))
    })
}
