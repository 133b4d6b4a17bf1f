//! Configuration for the channel index

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Channel index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between full reloads from the channel store
    pub refresh_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
        }
    }
}

impl Config {
    /// Reload period
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
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

        if let Ok(value) = std::env::var("CHANNEL_REFRESH_INTERVAL") {
            config.refresh_interval_secs = value
                .parse()
                .map_err(|e| crate::Error::Config(format!("CHANNEL_REFRESH_INTERVAL: {}", e)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_interval_clamped() {
        let config = Config {
            refresh_interval_secs: 0,
        };
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "refresh_interval_secs = 5").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.refresh_interval_secs, 5);
    }
}
