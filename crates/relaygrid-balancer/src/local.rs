//! Applying the config on the main server.

use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use relaygrid_core::{FleetError, FleetResult};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{info, warn};

use crate::snapshot::{ConfigSnapshot, snapshot};

const LOCAL_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// The main server's load balancer process.
#[async_trait]
pub trait LocalControl: Send + Sync {
    /// Check a candidate config file. `Err` carries the validator output.
    async fn validate(&self, path: &Path) -> Result<(), String>;

    /// Pick up the live config without dropping connections.
    async fn reload(&self) -> Result<(), String>;
}

/// `LocalControl` that shells out to the configured commands.
#[derive(Debug, Clone)]
pub struct CommandControl {
    validate_command: String,
    reload_command: String,
}

impl CommandControl {
    pub fn new(validate_command: impl Into<String>, reload_command: impl Into<String>) -> Self {
        Self {
            validate_command: validate_command.into(),
            reload_command: reload_command.into(),
        }
    }
}

async fn run_local(command_line: &str, extra_arg: Option<&Path>) -> Result<(), String> {
    let mut words = command_line.split_whitespace();
    let program = words.next().ok_or_else(|| "empty command".to_string())?;
    let mut cmd = Command::new(program);
    cmd.args(words).kill_on_drop(true);
    if let Some(arg) = extra_arg {
        cmd.arg(arg);
    }

    let output = tokio::time::timeout(LOCAL_COMMAND_TIMEOUT, cmd.output())
        .await
        .map_err(|_| format!("{program} timed out after {LOCAL_COMMAND_TIMEOUT:?}"))?
        .map_err(|e| format!("failed to execute {program}: {e}"))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        Err(format!("{program} exited with {}: {}", output.status, detail.trim()))
    }
}

#[async_trait]
impl LocalControl for CommandControl {
    async fn validate(&self, path: &Path) -> Result<(), String> {
        run_local(&self.validate_command, Some(path)).await
    }

    async fn reload(&self) -> Result<(), String> {
        run_local(&self.reload_command, None).await
    }
}

/// Validate `text` and, only if valid, atomically replace `live_path`
/// with it and reload. A rejected config never touches the live file.
pub async fn apply_locally(
    live_path: &Path,
    text: &str,
    control: &dyn LocalControl,
) -> FleetResult<ConfigSnapshot> {
    let dir = match live_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    // Same directory as the live file so the rename cannot cross filesystems.
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(text.as_bytes())?;
    staged.as_file().sync_all()?;
    keep_permissions(live_path, staged.path())?;

    if let Err(output) = control.validate(staged.path()).await {
        warn!(path = %live_path.display(), %output, "rendered config rejected locally");
        return Err(FleetError::ConfigValidation(output));
    }

    staged
        .persist(live_path)
        .map_err(|e| FleetError::Io(e.error))?;

    control.reload().await.map_err(|output| FleetError::RemoteCommand {
        node: "localhost".to_string(),
        exit_status: 1,
        output,
    })?;

    let snap = snapshot(text);
    info!(path = %live_path.display(), snapshot = %snap.short(), "config applied locally");
    Ok(snap)
}

/// Give the staged file the live file's permissions (0644 if new).
#[cfg(unix)]
fn keep_permissions(live: &Path, staged: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = match std::fs::metadata(live) {
        Ok(meta) => meta.permissions(),
        Err(_) => std::fs::Permissions::from_mode(0o644),
    };
    std::fs::set_permissions(staged, permissions)
}

#[cfg(not(unix))]
fn keep_permissions(_live: &Path, _staged: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryControl;

    #[tokio::test]
    async fn valid_config_replaces_live_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("haproxy.cfg");
        std::fs::write(&live, "old").unwrap();
        let control = MemoryControl::new();

        let snap = apply_locally(&live, "new", &control).await.unwrap();

        assert_eq!(std::fs::read_to_string(&live).unwrap(), "new");
        assert_eq!(snap, snapshot("new"));
        assert_eq!(control.reloads(), 1);
        // No stray temp files.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn rejected_config_leaves_live_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("haproxy.cfg");
        std::fs::write(&live, "old").unwrap();
        let control = MemoryControl::new();
        control.reject_containing("bogus");

        let err = apply_locally(&live, "bogus directive", &control).await.unwrap_err();

        assert!(matches!(err, FleetError::ConfigValidation(_)));
        assert_eq!(std::fs::read_to_string(&live).unwrap(), "old");
        assert_eq!(control.reloads(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn creates_missing_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("sub").join("haproxy.cfg");
        apply_locally(&live, "fresh", &MemoryControl::new()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&live).unwrap(), "fresh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn keeps_live_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("haproxy.cfg");
        std::fs::write(&live, "old").unwrap();
        std::fs::set_permissions(&live, std::fs::Permissions::from_mode(0o640)).unwrap();

        apply_locally(&live, "new", &MemoryControl::new()).await.unwrap();
        let mode = std::fs::metadata(&live).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }
}
