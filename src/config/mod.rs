//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files (`~/.config/amtp/config.toml` by default)
//! - Environment variables (`AMTP_*`), which take precedence
//! - CLI arguments (applied by the `amtp` binary on top of both)
//!
//! # Example
//!
//! ```toml
//! [agent]
//! address = "inventory@example.com"
//! gateway_url = "https://gateway.example.com"
//! delivery_mode = "pull"
//! supported_schemas = ["agntcy:commerce.*"]
//!
//! [session]
//! max_retries = 5
//! poll_interval_secs = 2.5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AmtpError, Result};
use crate::protocol::DeliveryMode;

/// Default gateway endpoint
pub const DEFAULT_GATEWAY_URL: &str = "http://localhost:8080";

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Agent identity
    #[serde(default)]
    pub agent: AgentConfig,

    /// Session tunables
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AmtpError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| AmtpError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load from `path` (or the default location if it exists), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(default) if default.is_file() => Self::from_file(default)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    /// `<config dir>/amtp/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("amtp").join("config.toml"))
    }

    /// Override fields from `AMTP_*` environment variables
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Agent settings
        if let Some(address) = lookup("AMTP_ADDRESS") {
            self.agent.address = Some(address);
        }
        if let Some(url) = lookup("AMTP_GATEWAY_URL") {
            self.agent.gateway_url = url;
        }
        if let Some(mode) = lookup("AMTP_DELIVERY_MODE") {
            match mode.parse() {
                Ok(mode) => self.agent.delivery_mode = mode,
                Err(e) => tracing::warn!("Ignoring AMTP_DELIVERY_MODE: {}", e),
            }
        }
        if let Some(key) = lookup("AMTP_API_KEY") {
            self.agent.api_key = Some(key);
        }

        // Session settings
        if let Some(val) = parse_var(&lookup, "AMTP_MAX_RETRIES") {
            self.session.max_retries = val;
        }
        if let Some(val) = parse_var(&lookup, "AMTP_RETRY_DELAY_SECS") {
            self.session.retry_delay_secs = val;
        }
        if let Some(val) = parse_var(&lookup, "AMTP_POLL_INTERVAL_SECS") {
            self.session.poll_interval_secs = val;
        }
        if let Some(val) = parse_var(&lookup, "AMTP_MAX_MESSAGE_SIZE") {
            self.session.max_message_size = val;
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(val) => Some(val),
        Err(_) => {
            tracing::warn!("Ignoring {}: cannot parse '{}'", key, raw);
            None
        }
    }
}

/// Agent identity and gateway selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent address (`agent@domain`)
    pub address: Option<String>,

    /// Gateway base URL
    pub gateway_url: String,

    /// Pull or push delivery
    pub delivery_mode: DeliveryMode,

    /// Pre-provisioned API key
    pub api_key: Option<String>,

    /// Schema-id patterns this agent accepts
    pub supported_schemas: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: None,
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            delivery_mode: DeliveryMode::Pull,
            api_key: None,
            supported_schemas: Vec::new(),
        }
    }
}

/// Timeouts, retry policy and quotas of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: f64,

    /// Per-request read timeout in seconds
    pub read_timeout_secs: f64,

    /// Total attempts for connection-level failures
    pub max_retries: u32,

    /// Base backoff delay in seconds
    pub retry_delay_secs: f64,

    /// Pause between inbox polls in seconds
    pub poll_interval_secs: f64,

    /// Maximum serialized message size in bytes
    pub max_message_size: usize,

    /// Messages requested per poll
    pub batch_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30.0,
            read_timeout_secs: 60.0,
            max_retries: 3,
            retry_delay_secs: 1.0,
            poll_interval_secs: 5.0,
            max_message_size: 10 * 1024 * 1024, // 10 MiB
            batch_size: 10,
        }
    }
}

impl SessionConfig {
    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    /// Read timeout
    pub fn read_timeout(&self) -> Duration {
        secs(self.read_timeout_secs)
    }

    /// Base retry delay
    pub fn retry_delay(&self) -> Duration {
        secs(self.retry_delay_secs)
    }

    /// Poll interval
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Set read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Set total attempts
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_secs = delay.as_secs_f64();
        self
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs_f64();
        self
    }

    /// Set message size quota
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set poll batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

// Negative or non-finite values collapse to zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}
