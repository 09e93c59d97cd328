//! In-memory main-server control for tests.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::local::LocalControl;

/// Validator that rejects configs containing a marker, with counters.
#[derive(Debug, Default)]
pub struct MemoryControl {
    reject_marker: Mutex<Option<String>>,
    fail_reload: AtomicBool,
    validated: AtomicU32,
    reloads: AtomicU32,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any config containing `marker`.
    pub fn reject_containing(&self, marker: &str) {
        *self
            .reject_marker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(marker.to_string());
    }

    pub fn accept_all(&self) {
        *self
            .reject_marker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    pub fn fail_reloads(&self, fail: bool) {
        self.fail_reload.store(fail, Ordering::SeqCst);
    }

    pub fn validations(&self) -> u32 {
        self.validated.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalControl for MemoryControl {
    async fn validate(&self, path: &Path) -> Result<(), String> {
        self.validated.fetch_add(1, Ordering::SeqCst);
        let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let marker = self
            .reject_marker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match marker {
            Some(marker) if text.contains(marker.as_str()) => {
                Err(format!("[ALERT] unknown keyword '{marker}'"))
            }
            _ => Ok(()),
        }
    }

    async fn reload(&self) -> Result<(), String> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reload.load(Ordering::SeqCst) {
            Err("reload failed".to_string())
        } else {
            Ok(())
        }
    }
}
