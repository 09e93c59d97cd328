//! relayctl: orchestrator facade over the relaygrid crates.
//!
//! [`Fleet`] wires the registry, remote executor, panel client, sync
//! engine, provisioner and notifier together and exposes the operations
//! the `relayctl` binary maps onto subcommands. Tests assemble it from
//! in-memory parts with [`Fleet::from_parts`].

pub mod fleet;

pub use fleet::{Fleet, FleetParts, ProvisionOutcome, RemovalReport};
