use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a rendered config. Two configs are in sync iff
/// their snapshots are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConfigSnapshot(String);

impl ConfigSnapshot {
    /// Wrap a digest reported by `sha256sum`.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for ConfigSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn snapshot(text: &str) -> ConfigSnapshot {
    ConfigSnapshot(hex::encode(Sha256::digest(text.as_bytes())))
}
