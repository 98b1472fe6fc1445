//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relay configuration
    pub relay: RelayConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address
    pub listen: String,
    /// TLS certificate path (PEM); generated self-signed when unset
    pub tls_cert: Option<String>,
    /// TLS key path (PEM)
    pub tls_key: Option<String>,
    /// Per-direction tunnel buffer size in bytes
    pub buf_size: usize,
    /// Maximum tunnel lifetime in seconds; 0 means unlimited
    pub max_time_secs: u64,
    /// Dial timeout in seconds for onward connections
    pub dial_timeout_secs: u64,
    /// Verify TLS certificates of onward relay hops
    pub tls_verify: bool,
    /// Allow dialing loopback targets (tests only)
    pub allow_loopback: bool,
    /// Origin string attached to this relay's own error statuses
    pub error_origin: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:443".to_string(),
            tls_cert: None,
            tls_key: None,
            buf_size: crate::DEFAULT_BUF_SIZE,
            max_time_secs: 0,
            dial_timeout_secs: 5,
            tls_verify: false,
            allow_loopback: false,
            error_origin: Some("relay".to_string()),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
