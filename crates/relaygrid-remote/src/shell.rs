//! The transport seam: one connection attempt, no policy.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use relaygrid_core::Redactor;
use relaygrid_registry::{NodeRecord, SshAccess};

use crate::error::TransportError;

/// Where and how to reach a node's shell.
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    pub name: String,
    pub address: IpAddr,
    pub ssh: SshAccess,
}

impl NodeEndpoint {
    pub fn new(name: impl Into<String>, address: IpAddr, ssh: SshAccess) -> Self {
        Self {
            name: name.into(),
            address,
            ssh,
        }
    }

    /// Redactor preloaded with this node's credential.
    pub fn redactor(&self) -> Redactor {
        let mut redactor = Redactor::new();
        if let Some(secret) = self.ssh.credential.secret() {
            redactor.add(secret);
        }
        redactor
    }
}

impl From<&NodeRecord> for NodeEndpoint {
    fn from(record: &NodeRecord) -> Self {
        Self::new(record.name.clone(), record.address, record.ssh.clone())
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_status: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// stderr if there is any, stdout otherwise, trimmed.
    pub fn summary(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Lifecycle actions on a node's proxy service (a compose project).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCommand {
    Start,
    Stop,
    Restart,
}

impl ServiceCommand {
    /// Shell line run inside `service_dir`.
    pub fn script(self, service_dir: &str) -> String {
        let action = match self {
            ServiceCommand::Start => "docker compose up -d",
            ServiceCommand::Stop => "docker compose down",
            ServiceCommand::Restart => "docker compose up -d --force-recreate",
        };
        format!("cd {} && {action}", shell_quote(service_dir))
    }
}

impl std::fmt::Display for ServiceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceCommand::Start => "start",
            ServiceCommand::Stop => "stop",
            ServiceCommand::Restart => "restart",
        };
        f.write_str(s)
    }
}

/// Single-attempt access to a node.
///
/// Implementations report a connection-level failure as `TransportError`
/// and everything that ran (whatever its exit status) as `CommandOutput`.
/// Retry, rate limiting and redaction live in `RemoteExecutor`.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(
        &self,
        node: &NodeEndpoint,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;

    async fn upload(
        &self,
        node: &NodeEndpoint,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;

    async fn download(
        &self,
        node: &NodeEndpoint,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;
}

/// Quote one word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@%+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_core::Secret;
    use relaygrid_registry::SshCredential;

    #[test]
    fn quote_leaves_plain_paths_alone() {
        assert_eq!(shell_quote("/etc/haproxy/haproxy.cfg"), "/etc/haproxy/haproxy.cfg");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn restart_recreates_containers() {
        let script = ServiceCommand::Restart.script("/opt/marzban-node");
        assert_eq!(script, "cd /opt/marzban-node && docker compose up -d --force-recreate");
    }

    #[test]
    fn endpoint_redacts_its_password() {
        let endpoint = NodeEndpoint::new(
            "node-a",
            "10.0.0.1".parse().unwrap(),
            SshAccess::new(
                "root",
                22,
                SshCredential::Password {
                    password: Secret::new("pw-123"),
                },
            ),
        );
        assert_eq!(endpoint.redactor().redact("login pw-123"), "login ***");
    }

    #[test]
    fn summary_prefers_stderr() {
        let out = CommandOutput {
            exit_status: 1,
            stdout: "partial\n".to_string(),
            stderr: "denied\n".to_string(),
        };
        assert_eq!(out.summary(), "denied");
        assert_eq!(CommandOutput::ok(" fine \n").summary(), "fine");
    }
}
