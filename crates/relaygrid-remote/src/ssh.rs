//! `RemoteShell` over the system OpenSSH client.
//!
//! Password logins go through `sshpass -e`, which reads the password from
//! the `SSHPASS` environment variable so it never appears in argv.

use std::net::IpAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use relaygrid_registry::SshCredential;
use tokio::process::Command;
use tracing::debug;

use crate::error::TransportError;
use crate::shell::{CommandOutput, NodeEndpoint, RemoteShell};

/// ssh and scp reserve exit status 255 for their own connection errors.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshShell {
    connect_timeout: Duration,
    keepalive: Option<Duration>,
}

impl SshShell {
    pub fn new(connect_timeout: Duration, keepalive: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            keepalive,
        }
    }

    /// `ssh` or `scp`, wrapped in `sshpass` when the node uses a password.
    fn command(&self, program: &str, node: &NodeEndpoint) -> Command {
        let mut cmd = match &node.ssh.credential {
            SshCredential::Password { password } => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).env("SSHPASS", password.expose());
                cmd
            }
            SshCredential::KeyFile { .. } | SshCredential::Agent => Command::new(program),
        };

        cmd.args(self.options(&node.ssh.credential))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn options(&self, credential: &SshCredential) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(interval) = self.keepalive {
            opts.push("-o".to_string());
            opts.push(format!("ServerAliveInterval={}", interval.as_secs().max(1)));
            opts.push("-o".to_string());
            opts.push("ServerAliveCountMax=3".to_string());
        }
        match credential {
            // BatchMode would suppress the password prompt sshpass answers.
            SshCredential::Password { .. } => {
                opts.push("-o".to_string());
                opts.push("PreferredAuthentications=password,keyboard-interactive".to_string());
            }
            SshCredential::KeyFile { path } => {
                opts.extend([
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    "IdentitiesOnly=yes".to_string(),
                    "-i".to_string(),
                    path.display().to_string(),
                ]);
            }
            SshCredential::Agent => {
                opts.push("-o".to_string());
                opts.push("BatchMode=yes".to_string());
            }
        }
        opts
    }

    async fn execute(
        &self,
        mut cmd: Command,
        program: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(|e| TransportError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(SSH_CONNECTION_FAILURE) => Err(TransportError::Connect(stderr.trim().to_string())),
            Some(exit_status) => Ok(CommandOutput {
                exit_status,
                stdout,
                stderr,
            }),
            None => Err(TransportError::Connect(format!(
                "{program} terminated by signal"
            ))),
        }
    }
}

/// `user@host` for ssh.
fn login(node: &NodeEndpoint) -> String {
    format!("{}@{}", node.ssh.user, node.address)
}

/// `user@host:path` for scp; IPv6 hosts need brackets.
fn scp_target(node: &NodeEndpoint, path: &str) -> String {
    match node.address {
        IpAddr::V4(ip) => format!("{}@{ip}:{path}", node.ssh.user),
        IpAddr::V6(ip) => format!("{}@[{ip}]:{path}", node.ssh.user),
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(
        &self,
        node: &NodeEndpoint,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        debug!(node = %node.name, host = %node.address, "ssh");
        let mut cmd = self.command("ssh", node);
        cmd.arg("-p")
            .arg(node.ssh.port.to_string())
            .arg(login(node))
            .arg("--")
            .arg(command);
        self.execute(cmd, "ssh", timeout).await
    }

    async fn upload(
        &self,
        node: &NodeEndpoint,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        debug!(node = %node.name, remote, "scp upload");
        let mut cmd = self.command("scp", node);
        cmd.arg("-q")
            .arg("-P")
            .arg(node.ssh.port.to_string())
            .arg(local)
            .arg(scp_target(node, remote));
        self.execute(cmd, "scp", timeout).await
    }

    async fn download(
        &self,
        node: &NodeEndpoint,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        debug!(node = %node.name, remote, "scp download");
        let mut cmd = self.command("scp", node);
        cmd.arg("-q")
            .arg("-P")
            .arg(node.ssh.port.to_string())
            .arg(scp_target(node, remote))
            .arg(local);
        self.execute(cmd, "scp", timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_core::Secret;
    use relaygrid_registry::SshAccess;

    fn endpoint(address: &str, credential: SshCredential) -> NodeEndpoint {
        NodeEndpoint::new(
            "node-a",
            address.parse().unwrap(),
            SshAccess::new("root", 2222, credential),
        )
    }

    #[test]
    fn password_never_lands_in_argv() {
        let shell = SshShell::new(Duration::from_secs(10), Some(Duration::from_secs(15)));
        let node = endpoint(
            "10.0.0.1",
            SshCredential::Password {
                password: Secret::new("pw-123"),
            },
        );
        let cmd = shell.command("ssh", &node);
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "sshpass");
        assert!(
            std_cmd
                .get_args()
                .all(|arg| !arg.to_string_lossy().contains("pw-123"))
        );
        let env: Vec<_> = std_cmd.get_envs().collect();
        assert!(env.iter().any(|(k, v)| *k == "SSHPASS" && v.is_some()));
    }

    #[test]
    fn key_logins_run_in_batch_mode() {
        let shell = SshShell::new(Duration::from_secs(10), None);
        let opts = shell.options(&SshCredential::KeyFile {
            path: "/root/.ssh/id_ed25519".into(),
        });
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"/root/.ssh/id_ed25519".to_string()));
        assert!(!opts.iter().any(|o| o.starts_with("ServerAliveInterval")));
    }

    #[test]
    fn scp_targets_bracket_ipv6() {
        let v4 = endpoint("10.0.0.1", SshCredential::Agent);
        let v6 = endpoint("fd00::1", SshCredential::Agent);
        assert_eq!(scp_target(&v4, "/tmp/x"), "root@10.0.0.1:/tmp/x");
        assert_eq!(scp_target(&v6, "/tmp/x"), "root@[fd00::1]:/tmp/x");
    }
}
