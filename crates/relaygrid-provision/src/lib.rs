//! relaygrid-provision: onboarding state machine for new nodes.
//!
//! ```text
//! Pending ──validate──▶ Registering ──add_node──▶ AwaitingCertificate
//!                            │                         │ poll certificate
//!                            ▼                         ▼
//!                          Failed ◀──────────────── Deploying ──verify──▶ Active
//!                                                                  └───▶ Degraded
//! ```
//!
//! Every transition is persisted before the next step starts, so an
//! interrupted run can be picked up with [`Provisioner::resume`].

pub mod env;
pub mod provisioner;
pub mod validate;

pub use provisioner::{ProvisionReport, ProvisionRequest, Provisioner};
pub use validate::validate_identity;
