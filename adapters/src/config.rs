//! Configuration for adapters

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream request timeout (seconds)
    pub request_timeout_secs: u64,

    /// Connect timeout (seconds)
    pub connect_timeout_secs: u64,

    /// Forward the client's bytes without conversion
    pub pass_through_request_enabled: bool,

    /// Ask OpenAI-compatible upstreams to append usage to streams
    pub force_stream_usage: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            connect_timeout_secs: 10,
            pass_through_request_enabled: false,
            force_stream_usage: true,
        }
    }
}

impl Config {
    /// Request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(value) = std::env::var("ADAPTER_TIMEOUT_SECS") {
            config.request_timeout_secs = value
                .parse()
                .map_err(|e| crate::Error::Config(format!("ADAPTER_TIMEOUT_SECS: {}", e)))?;
        }

        if let Ok(value) = std::env::var("PASS_THROUGH_REQUEST_ENABLED") {
            config.pass_through_request_enabled = value == "true" || value == "1";
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert!(!config.pass_through_request_enabled);
    }
}
