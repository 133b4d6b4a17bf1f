//! Configuration for the quota ledger

use crate::pricing::PriceTable;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Skip the reservation when the balance exceeds this many times the estimate
    pub trust_multiplier: i64,

    /// Quota units per currency unit (per-call prices are in currency)
    pub quota_per_unit: Decimal,

    /// Estimated tokens when the request does not set `max_tokens`
    pub default_pre_consume_tokens: u32,

    /// Bill models without a configured price at ratio 1 instead of rejecting
    pub allow_unpriced_models: bool,

    /// Price tables
    pub prices: PriceTable,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trust_multiplier: 100,
            quota_per_unit: Decimal::from(500_000),
            default_pre_consume_tokens: 500,
            allow_unpriced_models: false,
            prices: PriceTable::default(),
        }
    }
}

impl Config {
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

        if let Ok(value) = std::env::var("QUOTA_TRUST_MULTIPLIER") {
            config.trust_multiplier = value
                .parse()
                .map_err(|e| crate::Error::Config(format!("QUOTA_TRUST_MULTIPLIER: {}", e)))?;
        }

        if let Ok(value) = std::env::var("QUOTA_PER_UNIT") {
            config.quota_per_unit = value
                .parse()
                .map_err(|e| crate::Error::Config(format!("QUOTA_PER_UNIT: {}", e)))?;
        }

        if let Ok(value) = std::env::var("QUOTA_ALLOW_UNPRICED_MODELS") {
            config.allow_unpriced_models = value == "true" || value == "1";
        }

        Ok(config)
    }
}
