//! Relay configuration.
//!
//! Loaded from an optional TOML file, then overridden from `MCP_RELAY_*`
//! environment variables. Every field has a default, so an empty file (or
//! no file) is a valid configuration.
//!
//! ```toml
//! instance_id = "relay-a"
//! base_path = "/api"
//! enable_streamable_http = true
//!
//! [backplane]
//! max_poll_interval_ms = 1500
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secret::SecretString;

pub const ENV_INSTANCE_ID: &str = "MCP_RELAY_INSTANCE_ID";
pub const ENV_CLIENT_STATE_KEY: &str = "MCP_RELAY_CLIENT_STATE_KEY";
pub const ENV_ENABLE_SSE: &str = "MCP_RELAY_ENABLE_SSE";
pub const ENV_ENABLE_STREAMABLE_HTTP: &str = "MCP_RELAY_ENABLE_STREAMABLE_HTTP";
pub const ENV_BASE_PATH: &str = "MCP_RELAY_BASE_PATH";

/// Identity of the process that owns a set of sessions.
///
/// Passed explicitly to everything that needs it; there is no global.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<hostname>-<pid>`, falling back to `localhost` when the hostname
    /// cannot be read.
    pub fn detect() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self(format!("{}-{}", host, std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backplane polling settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackplaneConfig {
    /// Delay after the first empty poll
    pub min_poll_interval_ms: u64,
    /// Ceiling for the doubling delay between empty polls
    pub max_poll_interval_ms: u64,
    /// Entries requested per receive
    pub batch_size: usize,
    /// How long a received entry stays hidden before it is redelivered
    pub visibility_timeout_ms: u64,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: 100,
            max_poll_interval_ms: 1500,
            batch_size: 32,
            visibility_timeout_ms: 30_000,
        }
    }
}

impl BackplaneConfig {
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.min_poll_interval_ms))
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub instance_id: Option<InstanceId>,
    /// Operator secret for client state tokens. Absent means plain tokens.
    pub client_state_key: Option<SecretString>,
    pub enable_sse: bool,
    pub enable_streamable_http: bool,
    /// Prefix for every route, e.g. `/api`
    pub base_path: String,
    pub server_name: String,
    pub server_version: String,
    pub instructions: Option<String>,
    pub inbound_queue_capacity: usize,
    /// Seconds between SSE keep-alive comments; 0 disables them
    pub sse_keep_alive_secs: u64,
    pub backplane: BackplaneConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            client_state_key: None,
            enable_sse: true,
            enable_streamable_http: true,
            base_path: String::new(),
            server_name: env!("CARGO_PKG_NAME").to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
            inbound_queue_capacity: 64,
            sse_keep_alive_secs: 30,
            backplane: BackplaneConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Parse a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a TOML file. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Apply `MCP_RELAY_*` overrides from the process environment
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment, in practice)
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(id) = lookup(ENV_INSTANCE_ID).filter(|v| !v.is_empty()) {
            self.instance_id = Some(InstanceId::new(id));
        }
        if let Some(key) = lookup(ENV_CLIENT_STATE_KEY).filter(|v| !v.is_empty()) {
            self.client_state_key = Some(SecretString::new(key));
        }
        if let Some(v) = lookup(ENV_ENABLE_SSE) {
            self.enable_sse = parse_bool(ENV_ENABLE_SSE, &v)?;
        }
        if let Some(v) = lookup(ENV_ENABLE_STREAMABLE_HTTP) {
            self.enable_streamable_http = parse_bool(ENV_ENABLE_STREAMABLE_HTTP, &v)?;
        }
        if let Some(v) = lookup(ENV_BASE_PATH) {
            self.base_path = v;
        }
        Ok(self)
    }

    /// The configured instance id, or one derived from hostname and pid
    pub fn resolve_instance_id(&self) -> InstanceId {
        self.instance_id.clone().unwrap_or_else(InstanceId::detect)
    }

    /// `base_path` with a leading slash and no trailing slash; empty for root
    pub fn normalized_base_path(&self) -> String {
        let trimmed = self.base_path.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{}", trimmed)
        }
    }

    pub fn sse_keep_alive(&self) -> Option<Duration> {
        (self.sse_keep_alive_secs > 0).then(|| Duration::from_secs(self.sse_keep_alive_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enable_sse && !self.enable_streamable_http {
            return Err(Error::Config(
                "at least one of enable_sse and enable_streamable_http must be set".to_string(),
            ));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(Error::Config(
                "inbound_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.backplane.batch_size == 0 {
            return Err(Error::Config(
                "backplane.batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}
