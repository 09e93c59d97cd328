//! relaygrid-balancer: keeps the SNI load-balancer config identical on
//! the main server and every node.
//!
//! The config is always rendered whole from the registry (`render`), so
//! adding a node and removing it are exact inverses. The main server is
//! updated first (`local`); only if its own validator accepts the new text
//! is the fleet touched (`sync`). Each node gets a rollback point before
//! anything changes and is restored from it on any failure.

pub mod local;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod render;
pub mod report;
pub mod snapshot;
pub mod sync;

pub use local::{CommandControl, LocalControl, apply_locally};
pub use render::{MainServer, render_config};
pub use report::{NodeFailure, NodeOutcome, SyncCounts, SyncReport};
pub use snapshot::{ConfigSnapshot, snapshot};
pub use sync::SyncEngine;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryControl;
