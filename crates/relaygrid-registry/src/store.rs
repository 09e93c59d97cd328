//! Registry: redb-backed persistence for node records.
//!
//! Provides list/get/upsert/remove over `NodeRecord`s. Values are
//! JSON-serialized into redb's `&[u8]` value column.
//!
//! redb holds an exclusive lock on a database file for as long as it is
//! open. An on-disk registry is therefore opened for each operation and
//! closed when the operation ends, so the monitor and any number of CLI
//! invocations can share one registry file. The in-memory backend (tests)
//! stays open.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::tables::*;
use crate::types::*;

/// How long an operation waits for another process to close the file.
const OPEN_ATTEMPTS: u32 = 200;
const OPEN_BACKOFF: Duration = Duration::from_millis(25);

/// How `upsert` treats an existing record with the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert only; an existing name is a `DuplicateName` error.
    Create,
    /// Replace an existing record, or insert if absent.
    Replace,
}

#[derive(Clone)]
enum Backend {
    File(Arc<PathBuf>),
    Memory(Arc<Database>),
}

/// Node registry backed by redb. Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct Registry {
    backend: Backend,
}

impl Registry {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RegistryError::Open(e.to_string()))?;
            }
        }
        let registry = Self {
            backend: Backend::File(Arc::new(path.to_path_buf())),
        };
        registry.with_db(ensure_tables)?;
        debug!(?path, "registry opened");
        Ok(registry)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> RegistryResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        ensure_tables(&db)?;
        debug!("in-memory registry opened");
        Ok(Self {
            backend: Backend::Memory(Arc::new(db)),
        })
    }

    fn with_db<T>(&self, op: impl FnOnce(&Database) -> RegistryResult<T>) -> RegistryResult<T> {
        match &self.backend {
            Backend::Memory(db) => op(db),
            Backend::File(path) => {
                let db = open_shared(path)?;
                op(&db)
            }
        }
    }

    /// All records in insertion order, including `Removed` ones.
    pub fn list(&self) -> RegistryResult<Vec<NodeRecord>> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(NODES)?;
            let mut results = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                results.push(serde_json::from_slice::<NodeRecord>(value.value())?);
            }
            results.sort_by_key(|r| r.seq);
            Ok(results)
        })
    }

    /// Records that take part in syncing and monitoring (everything but `Removed`).
    pub fn list_active(&self) -> RegistryResult<Vec<NodeRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| !r.state.is_removed())
            .collect())
    }

    /// Get a record by name.
    pub fn get(&self, name: &str) -> RegistryResult<Option<NodeRecord>> {
        self.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(NODES)?;
            match table.get(name)? {
                Some(guard) => Ok(Some(serde_json::from_slice::<NodeRecord>(guard.value())?)),
                None => Ok(None),
            }
        })
    }

    /// Get a record that must exist.
    pub fn require(&self, name: &str) -> RegistryResult<NodeRecord> {
        self.get(name)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Write a whole record.
    ///
    /// On insert the registry assigns `seq`; on replace the stored `seq` and
    /// `created_at` are kept. The existence check and the write share one
    /// write transaction. Returns the record as stored.
    pub fn upsert(&self, record: &NodeRecord, mode: WriteMode) -> RegistryResult<NodeRecord> {
        record
            .check_invariants()
            .map_err(|reason| RegistryError::Invariant {
                name: record.name.clone(),
                reason,
            })?;

        self.with_db(|db| {
            let txn = db.begin_write()?;
            let stored = {
                let mut nodes = txn.open_table(NODES)?;
                let existing: Option<NodeRecord> = match nodes.get(record.name.as_str())? {
                    Some(guard) => Some(serde_json::from_slice(guard.value())?),
                    None => None,
                };

                match (existing, mode) {
                    (Some(_), WriteMode::Create) => None,
                    (Some(previous), WriteMode::Replace) => {
                        let mut next = record.clone();
                        next.seq = previous.seq;
                        next.created_at = previous.created_at;
                        nodes.insert(next.name.as_str(), serde_json::to_vec(&next)?.as_slice())?;
                        Some(next)
                    }
                    (None, _) => {
                        let mut meta = txn.open_table(META)?;
                        let seq = meta.get(NEXT_SEQ)?.map(|guard| guard.value()).unwrap_or(1);
                        meta.insert(NEXT_SEQ, seq + 1)?;

                        let mut next = record.clone();
                        next.seq = seq;
                        nodes.insert(next.name.as_str(), serde_json::to_vec(&next)?.as_slice())?;
                        Some(next)
                    }
                }
            };

            match stored {
                Some(next) => {
                    txn.commit()?;
                    debug!(node = %next.name, state = %next.state, seq = next.seq, "node record stored");
                    Ok(next)
                }
                None => {
                    txn.abort()?;
                    Err(RegistryError::DuplicateName(record.name.clone()))
                }
            }
        })
    }

    /// Read-modify-write a record in one transaction.
    pub fn update<F>(&self, name: &str, apply: F) -> RegistryResult<NodeRecord>
    where
        F: FnOnce(&mut NodeRecord),
    {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            let next = {
                let mut nodes = txn.open_table(NODES)?;
                let mut record: NodeRecord = match nodes.get(name)? {
                    Some(guard) => serde_json::from_slice(guard.value())?,
                    None => return Err(RegistryError::NotFound(name.to_string())),
                };
                let (seq, created_at) = (record.seq, record.created_at);

                apply(&mut record);
                record.name = name.to_string();
                record.seq = seq;
                record.created_at = created_at;
                record.updated_at = relaygrid_core::epoch_secs();
                record
                    .check_invariants()
                    .map_err(|reason| RegistryError::Invariant {
                        name: name.to_string(),
                        reason,
                    })?;

                nodes.insert(name, serde_json::to_vec(&record)?.as_slice())?;
                record
            };
            txn.commit()?;
            debug!(node = %name, state = %next.state, "node record updated");
            Ok(next)
        })
    }

    /// Move a record to `state`, keeping every other field.
    pub fn transition(&self, name: &str, state: NodeState) -> RegistryResult<NodeRecord> {
        self.update(name, |record| {
            *record = record.transitioned(state);
        })
    }

    /// Hard-delete a record. Returns true if it existed.
    pub fn remove(&self, name: &str) -> RegistryResult<bool> {
        self.with_db(|db| {
            let txn = db.begin_write()?;
            let existed = txn.open_table(NODES)?.remove(name)?.is_some();
            txn.commit()?;
            debug!(node = %name, existed, "node record deleted");
            Ok(existed)
        })
    }
}

fn ensure_tables(db: &Database) -> RegistryResult<()> {
    let txn = db.begin_write()?;
    txn.open_table(NODES)?;
    txn.open_table(META)?;
    txn.commit()?;
    Ok(())
}

/// Open the registry file, waiting while another handle (this process or
/// another one) has it open.
fn open_shared(path: &Path) -> RegistryResult<Database> {
    for attempt in 1..=OPEN_ATTEMPTS {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                if attempt == 1 {
                    debug!(?path, "registry busy, waiting");
                }
                std::thread::sleep(OPEN_BACKOFF);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(RegistryError::Busy(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_core::Secret;

    fn test_record(name: &str, last_octet: u8) -> NodeRecord {
        NodeRecord::pending(
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
        )
    }

    #[test]
    fn create_and_get() {
        let registry = Registry::open_in_memory().unwrap();
        let stored = registry
            .upsert(&test_record("a", 1), WriteMode::Create)
            .unwrap();

        let retrieved = registry.get("a").unwrap();
        assert_eq!(retrieved, Some(stored));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let registry = Registry::open_in_memory().unwrap();
        assert!(registry.get("nope").unwrap().is_none());
        assert!(matches!(
            registry.require("nope"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn create_duplicate_name_rejected() {
        let registry = Registry::open_in_memory().unwrap();
        registry
            .upsert(&test_record("a", 1), WriteMode::Create)
            .unwrap();

        let err = registry
            .upsert(&test_record("a", 2), WriteMode::Create)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(ref n) if n == "a"));

        // The original record is untouched.
        let kept = registry.require("a").unwrap();
        assert_eq!(kept.address.to_string(), "10.0.0.1");
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn replace_keeps_seq_and_created_at() {
        let registry = Registry::open_in_memory().unwrap();
        let first = registry
            .upsert(&test_record("a", 1), WriteMode::Create)
            .unwrap();

        let mut changed = first.transitioned(NodeState::Registering);
        changed.seq = 99;
        changed.created_at = 1;
        let stored = registry.upsert(&changed, WriteMode::Replace).unwrap();

        assert_eq!(stored.seq, first.seq);
        assert_eq!(stored.created_at, first.created_at);
        assert_eq!(stored.state, NodeState::Registering);
    }

    #[test]
    fn list_is_insertion_ordered() {
        let registry = Registry::open_in_memory().unwrap();
        for (name, octet) in [("zeta", 1), ("alpha", 2), ("mid", 3)] {
            registry
                .upsert(&test_record(name, octet), WriteMode::Create)
                .unwrap();
        }

        let names: Vec<String> = registry
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn list_active_skips_removed() {
        let registry = Registry::open_in_memory().unwrap();
        registry
            .upsert(&test_record("a", 1), WriteMode::Create)
            .unwrap();
        registry
            .upsert(&test_record("b", 2), WriteMode::Create)
            .unwrap();
        registry.transition("a", NodeState::Removed).unwrap();

        let active = registry.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "b");
        assert_eq!(registry.list().unwrap().len(), 2);
    }

    #[test]
    fn update_rejects_invariant_violation() {
        let registry = Registry::open_in_memory().unwrap();
        registry
            .upsert(&test_record("a", 1), WriteMode::Create)
            .unwrap();

        let err = registry
            .transition("a", NodeState::Active)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Invariant { .. }));
        assert_eq!(registry.require("a").unwrap().state, NodeState::Pending);
    }

    #[test]
    fn update_cannot_rename() {
        let registry = Registry::open_in_memory().unwrap();
        registry
            .upsert(&test_record("a", 1), WriteMode::Create)
            .unwrap();

        let updated = registry
            .update("a", |r| {
                r.name = "b".to_string();
                r.domain = "new.example.com".to_string();
            })
            .unwrap();
        assert_eq!(updated.name, "a");
        assert_eq!(updated.domain, "new.example.com");
        assert!(registry.get("b").unwrap().is_none());
    }

    #[test]
    fn update_missing_is_not_found() {
        let registry = Registry::open_in_memory().unwrap();
        let err = registry.transition("ghost", NodeState::Active).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn remove_deletes() {
        let registry = Registry::open_in_memory().unwrap();
        registry
            .upsert(&test_record("a", 1), WriteMode::Create)
            .unwrap();

        assert!(registry.remove("a").unwrap());
        assert!(!registry.remove("a").unwrap());
        assert!(registry.get("a").unwrap().is_none());
    }

    #[test]
    fn seq_is_not_reused_after_remove() {
        let registry = Registry::open_in_memory().unwrap();
        let a = registry
            .upsert(&test_record("a", 1), WriteMode::Create)
            .unwrap();
        registry.remove("a").unwrap();
        let b = registry
            .upsert(&test_record("b", 2), WriteMode::Create)
            .unwrap();
        assert!(b.seq > a.seq);
    }

    #[test]
    fn names_stay_unique_under_concurrent_creates() {
        let registry = Registry::open_in_memory().unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .upsert(&test_record("same", i + 1), WriteMode::Create)
                        .is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("registry.redb");

        let written = {
            let registry = Registry::open(&db_path).unwrap();
            let mut rec = registry
                .upsert(&test_record("a", 1), WriteMode::Create)
                .unwrap()
                .transitioned(NodeState::AwaitingCertificate);
            rec.control_plane_node_id = Some(42);
            registry.upsert(&rec, WriteMode::Replace).unwrap()
        };

        let registry = Registry::open(&db_path).unwrap();
        let reopened = registry.require("a").unwrap();
        assert_eq!(reopened, written);
        assert_eq!(reopened.control_plane_node_id, Some(42));
    }

    #[test]
    fn two_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.redb");
        let daemon = Registry::open(&path).unwrap();
        let cli = Registry::open(&path).unwrap();

        daemon
            .upsert(&test_record("a", 1), WriteMode::Create)
            .unwrap();
        cli.upsert(&test_record("b", 2), WriteMode::Create).unwrap();
        cli.transition("a", NodeState::Registering).unwrap();

        let names: Vec<String> = daemon.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(daemon.require("a").unwrap().state, NodeState::Registering);
    }

    #[test]
    fn file_creates_stay_unique_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.redb");
        Registry::open(&path).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let registry = Registry::open(&path).unwrap();
                    registry
                        .upsert(&test_record("same", i + 1), WriteMode::Create)
                        .is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(Registry::open(&path).unwrap().list().unwrap().len(), 1);
    }
}
