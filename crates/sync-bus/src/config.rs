//! # Bus Configuration
//!
//! Settings consumed by the synchronization bus, loadable from TOML with
//! environment overrides.
//!
//! ## Config File Format
//!
//! ```toml
//! [bus]
//! connection_string = "Endpoint=sb://example.servicebus.windows.net/;..."
//! topic_name = "NodeSync"
//! maintenance_interval_secs = 60
//! inactivity_timeout_secs = 180
//! subscription_idle_ttl_secs = 300
//! message_ttl_secs = 60
//! inbound_capacity = 1024
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `SYNC_CONNECTION_STRING` | `connection_string` |
//! | `SYNC_TOPIC_NAME` | `topic_name` |
//! | `SYNC_MAINTENANCE_INTERVAL_SECS` | `maintenance_interval_secs` |
//! | `SYNC_INACTIVITY_TIMEOUT_SECS` | `inactivity_timeout_secs` |

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Topic used when none is configured.
pub const DEFAULT_TOPIC_NAME: &str = "NodeSync";

/// Runtime configuration of the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Broker namespace connection string.
    pub connection_string: String,
    /// Shared topic. `None` or blank falls back to [`DEFAULT_TOPIC_NAME`].
    pub topic_name: Option<String>,
    /// Period of the heartbeat + sweep timer.
    pub maintenance_interval: Duration,
    /// Silence after which a peer's subscription is reclaimed.
    pub inactivity_timeout: Duration,
    /// Broker-side auto-delete window for the node's own subscription.
    pub subscription_idle_ttl: Duration,
    /// Broker-side time-to-live for undelivered messages.
    pub message_ttl: Duration,
    /// Buffer of the inbound envelope stream per subscriber.
    pub inbound_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            topic_name: None,
            maintenance_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(180),
            subscription_idle_ttl: Duration::from_secs(300),
            message_ttl: Duration::from_secs(60),
            inbound_capacity: 1024,
        }
    }
}

impl BusConfig {
    /// Config with a connection string and defaults for everything else.
    #[must_use]
    pub fn with_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    /// Effective topic name.
    #[must_use]
    pub fn topic_name(&self) -> &str {
        match self.topic_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_TOPIC_NAME,
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string. Absent keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let defaults = Self::default();
        let bus = file.bus;

        Ok(Self {
            connection_string: bus.connection_string.unwrap_or(defaults.connection_string),
            topic_name: bus.topic_name,
            maintenance_interval: bus
                .maintenance_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.maintenance_interval),
            inactivity_timeout: bus
                .inactivity_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.inactivity_timeout),
            subscription_idle_ttl: bus
                .subscription_idle_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.subscription_idle_ttl),
            message_ttl: bus
                .message_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.message_ttl),
            inbound_capacity: bus.inbound_capacity.unwrap_or(defaults.inbound_capacity),
        })
    }

    /// Apply `SYNC_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SYNC_CONNECTION_STRING") {
            self.connection_string = value;
        }
        if let Some(value) = lookup("SYNC_TOPIC_NAME") {
            self.topic_name = Some(value);
        }
        if let Some(secs) = parse_secs(&lookup, "SYNC_MAINTENANCE_INTERVAL_SECS")? {
            self.maintenance_interval = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "SYNC_INACTIVITY_TIMEOUT_SECS")? {
            self.inactivity_timeout = secs;
        }
        Ok(())
    }

    /// Check the values are usable.
    ///
    /// The connection string is checked at registration instead, so a config
    /// can be validated before secrets are injected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "maintenance_interval cannot be 0".into(),
            ));
        }
        // Peers heartbeat once per interval; a shorter timeout would evict live nodes.
        if self.inactivity_timeout <= self.maintenance_interval {
            return Err(ConfigError::Invalid(format!(
                "inactivity_timeout ({}s) must exceed maintenance_interval ({}s)",
                self.inactivity_timeout.as_secs(),
                self.maintenance_interval.as_secs()
            )));
        }
        if self.subscription_idle_ttl.is_zero() {
            return Err(ConfigError::Invalid(
                "subscription_idle_ttl cannot be 0".into(),
            ));
        }
        if self.inbound_capacity == 0 {
            return Err(ConfigError::Invalid("inbound_capacity cannot be 0".into()));
        }
        Ok(())
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| ConfigError::Invalid(format!("{key}={raw}: {e}"))),
    }
}

/// Configuration file structure.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    bus: BusSection,
}

#[derive(Debug, Deserialize, Default)]
struct BusSection {
    connection_string: Option<String>,
    topic_name: Option<String>,
    maintenance_interval_secs: Option<u64>,
    inactivity_timeout_secs: Option<u64>,
    subscription_idle_ttl_secs: Option<u64>,
    message_ttl_secs: Option<u64>,
    inbound_capacity: Option<usize>,
}

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Path of the file that failed to load.
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// Semantically invalid value.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
