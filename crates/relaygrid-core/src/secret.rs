//! Secret handling.
//!
//! `Secret` never prints its value through `Debug` or `Display`; the only
//! way to read it is [`Secret::expose`]. `Redactor` scrubs known secret
//! values out of free-form strings (command lines, remote output, HTTP
//! bodies) before they reach a log line or an error message.

use serde::{Deserialize, Serialize};

const MASK: &str = "***";

/// A sensitive string (password, token, key passphrase).
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read the raw value. Keep the result out of logs.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({MASK})")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(MASK)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Replaces every registered secret value in a string with `***`.
#[derive(Clone, Default)]
pub struct Redactor {
    values: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Redactor::add`].
    pub fn with(mut self, secret: &Secret) -> Self {
        self.add(secret);
        self
    }

    /// Register a secret. Empty values are ignored.
    pub fn add(&mut self, secret: &Secret) {
        if secret.is_empty() || self.values.iter().any(|v| v == secret.expose()) {
            return;
        }
        self.values.push(secret.expose().to_string());
        // Longest first so a secret containing another is masked whole.
        self.values.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    pub fn redact(&self, input: &str) -> String {
        let mut out = input.to_string();
        for value in &self.values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), MASK);
            }
        }
        out
    }
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("secrets", &self.values.len())
            .finish()
    }
}
