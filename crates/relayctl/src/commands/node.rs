use std::path::PathBuf;
use std::process::ExitCode;

use relaygrid_core::Secret;
use relaygrid_provision::ProvisionRequest;
use relaygrid_registry::{NodeState, SshAccess, SshCredential};
use relayctl::{Fleet, ProvisionOutcome};

use super::{Format, print_json, print_sync, sync_exit};

pub struct ProvisionArgs {
    pub name: String,
    pub address: String,
    pub domain: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_password: Option<String>,
    pub ssh_key: Option<PathBuf>,
    pub backend_port: Option<u16>,
}

impl ProvisionArgs {
    fn into_request(self) -> ProvisionRequest {
        let credential = match (self.ssh_password, self.ssh_key) {
            (Some(password), _) => SshCredential::Password {
                password: Secret::new(password),
            },
            (None, Some(path)) => SshCredential::KeyFile { path },
            (None, None) => SshCredential::Agent,
        };
        ProvisionRequest {
            name: self.name,
            address: self.address,
            domain: self.domain,
            ssh: SshAccess::new(self.ssh_user, self.ssh_port, credential),
            backend_port: self.backend_port,
        }
    }
}

pub async fn provision(fleet: &Fleet, args: ProvisionArgs, format: Format) -> anyhow::Result<ExitCode> {
    let outcome = fleet.provision_node(args.into_request()).await?;
    report_provisioning(&outcome, format)
}

pub async fn resume(fleet: &Fleet, name: &str, format: Format) -> anyhow::Result<ExitCode> {
    let outcome = fleet.resume_node(name).await?;
    report_provisioning(&outcome, format)
}

fn report_provisioning(outcome: &ProvisionOutcome, format: Format) -> anyhow::Result<ExitCode> {
    match format {
        Format::Json => print_json(outcome)?,
        Format::Text => {
            let node = outcome.node();
            let path: Vec<String> = outcome.provision.visited.iter().map(|s| s.to_string()).collect();
            println!("{}: {}", node.name, path.join(" → "));
            if node.state == NodeState::Degraded {
                println!(
                    "  warning: deployed but health not confirmed ({})",
                    node.last_error.as_deref().unwrap_or("no detail")
                );
            }
            if let Some(sync) = &outcome.sync {
                print_sync(sync);
            }
            if let Some(e) = &outcome.sync_error {
                println!("  fleet sync failed: {e}");
            }
        }
    }
    if outcome.sync_error.is_some() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(outcome.sync.as_ref().map_or(ExitCode::SUCCESS, sync_exit))
}

pub async fn remove(fleet: &Fleet, name: &str, retain: bool, format: Format) -> anyhow::Result<ExitCode> {
    let report = fleet.remove_node(name, retain).await?;
    match format {
        Format::Json => print_json(&report)?,
        Format::Text => {
            println!("{}: {}", report.node, if report.retained { "marked removed" } else { "deleted" });
            match &report.deregister_error {
                None => println!("  control plane: deregistered"),
                Some(e) => println!("  control plane: deregistration failed: {e}"),
            }
            match (&report.stop_error, report.service_stopped) {
                (Some(e), _) => println!("  service: stop failed: {e}"),
                (None, true) => println!("  service: stopped"),
                (None, false) => println!("  service: not deployed"),
            }
            print_sync(&report.sync);
        }
    }
    Ok(sync_exit(&report.sync))
}

pub fn list(fleet: &Fleet, format: Format) -> anyhow::Result<ExitCode> {
    let records = fleet.list()?;
    match format {
        Format::Json => print_json(&records)?,
        Format::Text => {
            println!("{:<16} {:<22} {:<40} {:<30} {:>6}", "NAME", "STATE", "ADDRESS", "DOMAIN", "ID");
            for r in &records {
                let id = r
                    .control_plane_node_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<16} {:<22} {:<40} {:<30} {:>6}",
                    r.name,
                    r.state.to_string(),
                    r.address.to_string(),
                    r.domain,
                    id
                );
                if let Some(e) = &r.last_error {
                    println!("  last error: {e}");
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
