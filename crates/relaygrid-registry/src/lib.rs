//! relaygrid-registry: durable store of managed proxy nodes.
//!
//! Backed by [redb](https://docs.rs/redb). Each `NodeRecord` is JSON-serialized
//! into a `&[u8]` value keyed by the node name. Every mutation is a
//! whole-record replacement inside a single write transaction, and redb
//! commits are copy-on-write, so a crash mid-write leaves the previous
//! committed registry intact and readers never see a torn record.
//!
//! `Registry` is `Clone` + `Send` + `Sync`. An on-disk registry keeps no
//! file open between operations, so separate processes (the monitor and CLI
//! invocations) can share it.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use store::{Registry, WriteMode};
pub use types::*;
