//! relaygrid-remote: command execution and file transfer on fleet nodes.
//!
//! # Architecture
//!
//! ```text
//! RemoteExecutor (policy)
//!   ├── RateLimiter: fleet-wide spacing between connection attempts
//!   ├── retry(): 3 attempts, fixed backoff, connection failures only
//!   ├── Redactor: node secrets scrubbed from logs and errors
//!   └── Arc<dyn RemoteShell> (one attempt, no policy)
//!       ├── SshShell: system ssh/scp, sshpass for password logins
//!       └── MemoryShell: in-memory fleet (feature `test-util`)
//! ```
//!
//! `NodeLocks` serializes writers per node across the whole orchestrator,
//! and across processes when given a lock directory.
//!
//! A command that ran and exited non-zero is never retried: re-running a
//! failed remote mutation could apply it twice.

pub mod error;
pub mod executor;
pub mod limiter;
pub mod locks;
pub mod shell;
pub mod ssh;

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use error::{RemoteError, RemoteResult, TransportError};
pub use executor::RemoteExecutor;
pub use limiter::RateLimiter;
pub use locks::{NodeGuard, NodeLocks};
pub use shell::{CommandOutput, NodeEndpoint, RemoteShell, ServiceCommand};
pub use ssh::SshShell;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryShell;
