//! relaygrid-monitor: periodic drift and health control loop.
//!
//! Each cycle:
//!
//! 1. **Drift**: hash every serving node's live load-balancer config and
//!    compare it with the authoritative render; resync only the nodes that
//!    differ.
//! 2. **Health**: ask the control plane whether each node is connected;
//!    restart unhealthy nodes once, re-check after a delay, and mark nodes
//!    that stay unhealthy `Degraded` for manual attention.
//! 3. **Notify**: every drift, rollback, unreachable and unhealthy event
//!    goes to the configured `Notifier`.

pub mod health;
pub mod monitor;
pub mod notify;

pub use health::{HealthReport, UnhealthyNode, check_health};
pub use monitor::{CycleReport, FleetMonitor};
pub use notify::{FanoutNotifier, FleetEvent, LogNotifier, Notifier, WebhookNotifier, report_sync};

#[cfg(any(test, feature = "test-util"))]
pub use notify::RecordingNotifier;
