//! Relay configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("probe_timeout ({timeout:?}) must exceed probe_interval ({interval:?})")]
    ProbeWindow {
        interval: Duration,
        timeout: Duration,
    },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Addresses the server is built with
///
/// An empty address disables automatic setup of that role; the connection can
/// still be attached externally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAddresses {
    pub plugin: String,
    pub tunnel: String,
    /// Handed to data connectors, never dialed by the server itself
    pub data: String,
}

impl RelayAddresses {
    pub fn new(
        plugin: impl Into<String>,
        tunnel: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            tunnel: tunnel.into(),
            data: data.into(),
        }
    }
}

/// Timing and buffering parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Deadline of a single read attempt in the poll loops
    #[serde(with = "duration_millis")]
    pub read_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub write_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub dial_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub probe_interval: Duration,
    /// Silence window after which the tunnel is declared dead
    #[serde(with = "duration_millis")]
    pub probe_timeout: Duration,
    /// Capacity of the dispatch request channel
    pub request_buffer: usize,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(15),
            request_buffer: 128,
        }
    }
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: RelayConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("dial_timeout", self.dial_timeout),
            ("probe_interval", self.probe_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.request_buffer == 0 {
            return Err(ConfigError::Zero("request_buffer"));
        }
        if self.probe_timeout <= self.probe_interval {
            return Err(ConfigError::ProbeWindow {
                interval: self.probe_interval,
                timeout: self.probe_timeout,
            });
        }
        Ok(())
    }
}

/// Builder for RelayConfig
#[derive(Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn request_buffer(mut self, capacity: usize) -> Self {
        self.config.request_buffer = capacity;
        self
    }

    pub fn build(self) -> Result<RelayConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
