//! Redacting wrapper for operator secrets.
//!
//! The client-state key ends up inside [`RelayConfig`](crate::config::RelayConfig),
//! which is logged at startup. [`SecretString`] keeps it out of `Debug` and
//! `Display` output.
//!
//! ```rust
//! use mcp_relay::SecretString;
//!
//! let key = SecretString::new("hunter2");
//! assert_eq!(format!("{:?}", key), "[REDACTED]");
//! assert_eq!(key.expose(), "hunter2");
//! ```

use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Deserializer};

/// A string whose contents never appear in formatted output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString {
    value: String,
}

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        Self { value: s.into() }
    }

    /// Expose the underlying secret value.
    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl Debug for SecretString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Display for SecretString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::new)
    }
}
