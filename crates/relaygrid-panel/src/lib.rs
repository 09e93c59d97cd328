//! relaygrid-panel: client for the central panel's REST API.
//!
//! The panel tracks nodes and issues the client certificate each node
//! presents when it connects back. `ControlPlane` is the seam the
//! provisioner, the monitor and the facade depend on; `PanelClient` talks
//! to the real API over HTTPS, `MemoryPanel` (feature `test-util`) stands
//! in for it in tests.

pub mod client;
pub mod error;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use async_trait::async_trait;
use relaygrid_core::Secret;

pub use client::PanelClient;
pub use error::{PanelError, PanelResult};
pub use types::{NewNode, PanelCredentials, PanelNode, PanelNodeStatus};

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryPanel;

/// Operations the orchestrator needs from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Bearer token, fetched once and cached until invalidated.
    async fn authenticate(&self) -> PanelResult<Secret>;

    /// Drop the cached token; the next call authenticates again.
    fn invalidate_token(&self);

    /// Register a node. If the panel already knows the name, the existing
    /// id is returned instead of an error.
    async fn add_node(&self, node: &NewNode) -> PanelResult<u64>;

    async fn get_node(&self, id: u64) -> PanelResult<PanelNode>;

    async fn list_nodes(&self) -> PanelResult<Vec<PanelNode>>;

    async fn delete_node(&self, id: u64) -> PanelResult<()>;
}
