//! Policy layer over a `RemoteShell`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use relaygrid_core::{Redactor, RetryPolicy, retry};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{RemoteError, RemoteResult, TransportError};
use crate::limiter::RateLimiter;
use crate::shell::{CommandOutput, NodeEndpoint, RemoteShell, ServiceCommand, shell_quote};

/// Suffix of the staging file `write_file` uploads before moving it into place.
const STAGING_SUFFIX: &str = ".relaygrid-tmp";

/// Outcome of one policy-wrapped attempt.
#[derive(Debug)]
enum Attempt {
    /// Redacted transport failure; retryable.
    Transport(String),
    Exited(CommandOutput),
}

impl std::fmt::Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attempt::Transport(reason) => f.write_str(reason),
            Attempt::Exited(out) => write!(f, "exit {}", out.exit_status),
        }
    }
}

/// Runs commands and moves files on nodes with bounded retry, fleet-wide
/// rate limiting, mandatory timeouts and secret redaction.
#[derive(Clone)]
pub struct RemoteExecutor {
    shell: Arc<dyn RemoteShell>,
    policy: RetryPolicy,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
}

impl RemoteExecutor {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        policy: RetryPolicy,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Self {
        Self {
            shell,
            policy,
            limiter,
            timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `command` with the default timeout. A non-zero exit is an error.
    pub async fn run(&self, node: &NodeEndpoint, command: &str) -> RemoteResult<CommandOutput> {
        self.run_with_timeout(node, command, self.timeout).await
    }

    pub async fn run_with_timeout(
        &self,
        node: &NodeEndpoint,
        command: &str,
        timeout: Duration,
    ) -> RemoteResult<CommandOutput> {
        let redactor = node.redactor();
        debug!(node = %node.name, command = %redactor.redact(command), "running remote command");
        let shell = &self.shell;
        self.attempt(node, &redactor, || shell.run(node, command, timeout))
            .await
    }

    /// Run a probe command: exit 0 is `true`, any other exit is `false`.
    /// Only an unreachable node is an error.
    pub async fn check(&self, node: &NodeEndpoint, command: &str) -> RemoteResult<bool> {
        match self.run(node, command).await {
            Ok(_) => Ok(true),
            Err(RemoteError::Command { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy a local file to `remote`.
    pub async fn transfer_to(
        &self,
        node: &NodeEndpoint,
        local: &Path,
        remote: &str,
    ) -> RemoteResult<()> {
        let redactor = node.redactor();
        let shell = &self.shell;
        let timeout = self.timeout;
        self.attempt(node, &redactor, || shell.upload(node, local, remote, timeout))
            .await?;
        Ok(())
    }

    /// Copy `remote` to a local file.
    pub async fn transfer_from(
        &self,
        node: &NodeEndpoint,
        remote: &str,
        local: &Path,
    ) -> RemoteResult<()> {
        let redactor = node.redactor();
        let shell = &self.shell;
        let timeout = self.timeout;
        self.attempt(node, &redactor, || shell.download(node, remote, local, timeout))
            .await?;
        Ok(())
    }

    /// Write `contents` to `remote`, replacing it atomically. The staged
    /// copy gets `mode` before it is moved into place, so the final path
    /// never exists with looser permissions.
    pub async fn write_file(
        &self,
        node: &NodeEndpoint,
        remote: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> RemoteResult<()> {
        let mut local = NamedTempFile::new()?;
        std::io::Write::write_all(&mut local, contents)?;

        if let Some(parent) = Path::new(remote).parent().and_then(|p| p.to_str())
            && !parent.is_empty()
        {
            self.run(node, &format!("mkdir -p {}", shell_quote(parent)))
                .await?;
        }

        let staged = format!("{remote}{STAGING_SUFFIX}");
        self.transfer_to(node, local.path(), &staged).await?;

        let staged_q = shell_quote(&staged);
        let finish = match mode {
            Some(mode) => format!(
                "chmod {mode:o} {staged_q} && mv -f {staged_q} {}",
                shell_quote(remote)
            ),
            None => format!("mv -f {staged_q} {}", shell_quote(remote)),
        };
        self.run(node, &finish).await?;
        Ok(())
    }

    pub async fn read_file(&self, node: &NodeEndpoint, remote: &str) -> RemoteResult<Vec<u8>> {
        let local = NamedTempFile::new()?;
        self.transfer_from(node, remote, local.path()).await?;
        Ok(std::fs::read(local.path())?)
    }

    pub async fn file_exists(&self, node: &NodeEndpoint, remote: &str) -> RemoteResult<bool> {
        self.check(node, &format!("test -f {}", shell_quote(remote)))
            .await
    }

    /// SHA-256 hex digest of a remote file, `None` if it does not exist.
    pub async fn file_digest(
        &self,
        node: &NodeEndpoint,
        remote: &str,
    ) -> RemoteResult<Option<String>> {
        if !self.file_exists(node, remote).await? {
            return Ok(None);
        }
        let out = self
            .run(node, &format!("sha256sum {}", shell_quote(remote)))
            .await?;
        let digest = out.stdout.split_whitespace().next().unwrap_or_default();
        if digest.len() != 64 {
            return Err(RemoteError::Command {
                node: node.name.clone(),
                exit_status: out.exit_status,
                output: format!("unexpected sha256sum output: {}", out.stdout.trim()),
            });
        }
        Ok(Some(digest.to_string()))
    }

    /// Start, stop or restart the node's proxy service.
    pub async fn service(
        &self,
        node: &NodeEndpoint,
        command: ServiceCommand,
        service_dir: &str,
    ) -> RemoteResult<CommandOutput> {
        debug!(node = %node.name, action = %command, "service control");
        self.run(node, &command.script(service_dir)).await
    }

    async fn attempt<F, Fut>(
        &self,
        node: &NodeEndpoint,
        redactor: &Redactor,
        op: F,
    ) -> RemoteResult<CommandOutput>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CommandOutput, TransportError>>,
    {
        let limiter = &self.limiter;
        let op = &op;
        let operation = format!("remote call to {}", node.name);

        let result = retry(
            &self.policy,
            &operation,
            |e: &Attempt| matches!(e, Attempt::Transport(_)),
            move |_attempt| async move {
                limiter.acquire().await;
                match op().await {
                    Ok(out) if out.success() => Ok(out),
                    Ok(out) => Err(Attempt::Exited(out)),
                    Err(e) => Err(Attempt::Transport(redactor.redact(&e.to_string()))),
                }
            },
        )
        .await;

        match result {
            Ok(out) => Ok(out),
            Err(Attempt::Transport(reason)) => {
                let attempts = self.policy.max_attempts.max(1);
                warn!(node = %node.name, attempts, %reason, "node unreachable");
                Err(RemoteError::Unreachable {
                    node: node.name.clone(),
                    attempts,
                    reason,
                })
            }
            Err(Attempt::Exited(out)) => Err(RemoteError::Command {
                node: node.name.clone(),
                exit_status: out.exit_status,
                output: redactor.redact(out.summary()),
            }),
        }
    }
}
