//! relaygrid-core: shared building blocks for the relaygrid fleet orchestrator.
//!
//! Every other relaygrid crate depends on this one for:
//!
//! - **`config`**: `relaygrid.toml` parsing (`FleetConfig`)
//! - **`retry`**: the bounded retry and poll abstractions used by the
//!   remote executor, the panel client and the provisioner
//! - **`secret`**: `Secret` and `Redactor`, which keep credentials out of logs
//! - **`error`**: `FleetError`, the error taxonomy surfaced to operators

pub mod config;
pub mod error;
pub mod retry;
pub mod secret;

pub use config::FleetConfig;
pub use error::{FleetError, FleetResult};
pub use retry::{PollError, PollPolicy, Probe, RetryPolicy, poll_until, retry};
pub use secret::{Redactor, Secret};

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix time in milliseconds.
pub fn epoch_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
