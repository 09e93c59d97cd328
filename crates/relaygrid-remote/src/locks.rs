//! Per-node write serialization.
//!
//! Within a process every node name maps to one async mutex. With a lock
//! directory, a node's guard additionally holds an exclusive `flock` on
//! `<dir>/<node>.lock`, which keeps the monitor daemon and CLI invocations
//! (separate processes) off the same node at the same time.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};

/// How often a blocked writer retries another process's file lock.
const FILE_LOCK_POLL: Duration = Duration::from_millis(50);

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// One lock per node name. Every component that mutates a node (sync
/// engine, provisioner, monitor, removal) holds the node's lock for the
/// whole mutation, so two writers never interleave on one node.
#[derive(Debug, Clone, Default)]
pub struct NodeLocks {
    locks: Arc<Mutex<LockMap>>,
    dir: Option<Arc<PathBuf>>,
}

/// Exclusive right to mutate one node. Released on drop.
#[derive(Debug)]
pub struct NodeGuard {
    // Declared first so the file lock goes before the in-process one.
    _file: Option<File>,
    _local: OwnedMutexGuard<()>,
}

impl NodeLocks {
    /// Locks that only coordinate tasks of this process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks shared with every process using the same `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> RemoteResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            locks: Arc::default(),
            dir: Some(Arc::new(dir)),
        })
    }

    pub async fn lock(&self, node: &str) -> RemoteResult<NodeGuard> {
        let local = self.entry(node).lock_owned().await;
        let file = match &self.dir {
            None => None,
            Some(dir) => {
                let file = open_lock_file(dir, node).map_err(|e| lock_error(node, e))?;
                let mut waited = false;
                while !try_flock(&file).map_err(|e| lock_error(node, e))? {
                    if !waited {
                        debug!(node, "node locked by another process, waiting");
                        waited = true;
                    }
                    tokio::time::sleep(FILE_LOCK_POLL).await;
                }
                Some(file)
            }
        };
        Ok(NodeGuard {
            _file: file,
            _local: local,
        })
    }

    /// Non-blocking variant; `None` while another writer holds the node.
    pub fn try_lock(&self, node: &str) -> RemoteResult<Option<NodeGuard>> {
        let Ok(local) = self.entry(node).try_lock_owned() else {
            return Ok(None);
        };
        let file = match &self.dir {
            None => None,
            Some(dir) => {
                let file = open_lock_file(dir, node).map_err(|e| lock_error(node, e))?;
                if !try_flock(&file).map_err(|e| lock_error(node, e))? {
                    return Ok(None);
                }
                Some(file)
            }
        };
        Ok(Some(NodeGuard {
            _file: file,
            _local: local,
        }))
    }

    /// Drop the in-process lock of a node that left the fleet, unless a
    /// writer still holds or waits for it. Lock files stay on disk.
    pub fn forget(&self, node: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(node)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(node);
        }
    }

    fn entry(&self, node: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(node.to_string()).or_default().clone()
    }
}

fn open_lock_file(dir: &Path, node: &str) -> io::Result<File> {
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(format!("{node}.lock")))
}

fn lock_error(node: &str, source: io::Error) -> RemoteError {
    RemoteError::Lock {
        node: node.to_string(),
        source,
    }
}

/// `Ok(false)` while another open file description holds the lock.
#[cfg(unix)]
fn try_flock(file: &File) -> io::Result<bool> {
    use std::os::fd::AsRawFd;

    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_node_is_exclusive() {
        let locks = NodeLocks::new();
        let guard = locks.lock("a").await.unwrap();
        assert!(locks.try_lock("a").unwrap().is_none());
        assert!(locks.try_lock("b").unwrap().is_some());
        drop(guard);
        assert!(locks.try_lock("a").unwrap().is_some());
    }

    #[tokio::test]
    async fn clones_share_locks() {
        let locks = NodeLocks::new();
        let other = locks.clone();
        let _guard = locks.lock("a").await.unwrap();
        assert!(other.try_lock("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn forget_keeps_a_lock_someone_waits_for() {
        let locks = NodeLocks::new();
        let first = locks.lock("a").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let guard = locks.lock("a").await.unwrap();
                tokio::time::sleep(Duration::from_millis(100)).await;
                drop(guard);
            })
        };
        // Let the waiter queue on the mutex.
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        locks.forget("a");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The waiter now holds the node; nobody else may.
        assert!(locks.try_lock("a").unwrap().is_none());
        waiter.await.unwrap();
        assert!(locks.try_lock("a").unwrap().is_some());
    }

    #[tokio::test]
    async fn forget_drops_an_idle_lock() {
        let locks = NodeLocks::new();
        drop(locks.lock("a").await.unwrap());
        locks.forget("a");
        assert!(locks.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_dir_is_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = NodeLocks::in_dir(dir.path()).unwrap();
        let cli = NodeLocks::in_dir(dir.path()).unwrap();

        let guard = monitor.lock("a").await.unwrap();
        assert!(cli.try_lock("a").unwrap().is_none());
        assert!(cli.try_lock("b").unwrap().is_some());

        let blocked = tokio::time::timeout(Duration::from_millis(150), cli.lock("a")).await;
        assert!(blocked.is_err());

        drop(guard);
        let acquired = tokio::time::timeout(Duration::from_secs(2), cli.lock("a")).await;
        assert!(acquired.unwrap().is_ok());
    }
}
