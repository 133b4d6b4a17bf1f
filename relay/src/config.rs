//! Configuration for the relay

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retries after the first attempt
    pub retry_times: u32,

    /// Whole-request deadline (seconds); routes may override
    pub request_deadline_secs: Option<u64>,

    /// Providers whose 400 responses are worth retrying elsewhere
    pub bad_request_retry_providers: Vec<String>,

    /// Write an error log record for every failed attempt
    pub error_log_enabled: bool,

    /// Archive request/response pairs of successful requests
    pub archive_enabled: bool,

    /// Chunks buffered between a streaming relay and its reader
    pub stream_buffer: usize,

    /// Background task pool
    pub task_pool: TaskPoolConfig,

    /// Channel auto-ban policy
    pub auto_ban: AutoBanConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_times: 3,
            request_deadline_secs: None,
            bad_request_retry_providers: vec!["anthropic".to_string()],
            error_log_enabled: false,
            archive_enabled: false,
            stream_buffer: 64,
            task_pool: TaskPoolConfig::default(),
            auto_ban: AutoBanConfig::default(),
        }
    }
}

/// Task pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPoolConfig {
    /// Worker tasks
    pub workers: usize,

    /// Queued jobs before overflow
    pub queue_capacity: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

/// Which failures disable a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBanConfig {
    /// Master switch
    pub enabled: bool,

    /// Statuses that always disable
    pub status_codes: Vec<u16>,

    /// Upstream error codes that disable
    pub error_codes: Vec<String>,

    /// Upstream error types that disable
    pub error_types: Vec<String>,

    /// Case-insensitive message fragments that disable
    pub keywords: Vec<String>,
}

impl Default for AutoBanConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            enabled: true,
            status_codes: vec![401],
            error_codes: owned(&["invalid_api_key", "account_deactivated", "billing_not_active"]),
            error_types: owned(&[
                "insufficient_quota",
                "authentication_error",
                "permission_error",
                "forbidden",
            ]),
            keywords: owned(&[
                "your credit balance is too low",
                "this organization has been disabled",
                "you exceeded your current quota",
                "permission denied",
                "the security token included in the request is invalid",
                "operation not allowed",
                "your account is not authorized",
            ]),
        }
    }
}

impl Config {
    /// Deadline applied when the route sets none
    pub fn request_deadline(&self) -> Option<Duration> {
        self.request_deadline_secs.map(Duration::from_secs)
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

        if let Ok(value) = std::env::var("RELAY_RETRY_TIMES") {
            config.retry_times = value
                .parse()
                .map_err(|e| crate::Error::Config(format!("RELAY_RETRY_TIMES: {}", e)))?;
        }

        if let Ok(value) = std::env::var("RELAY_DEADLINE_SECS") {
            config.request_deadline_secs = Some(
                value
                    .parse()
                    .map_err(|e| crate::Error::Config(format!("RELAY_DEADLINE_SECS: {}", e)))?,
            );
        }

        if let Ok(value) = std::env::var("ERROR_LOG_ENABLED") {
            config.error_log_enabled = value == "true" || value == "1";
        }

        if let Ok(value) = std::env::var("ARCHIVE_ENABLED") {
            config.archive_enabled = value == "true" || value == "1";
        }

        if let Ok(value) = std::env::var("AUTO_BAN_ENABLED") {
            config.auto_ban.enabled = value == "true" || value == "1";
        }

        Ok(config)
    }
}

/// All sections of a gateway deployment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `[relay]`
    pub relay: Config,

    /// `[quota]`
    pub quota: quota_ledger::Config,

    /// `[channels]`
    pub channels: channel_index::Config,

    /// `[adapters]`
    pub adapters: adapters::Config,
}

impl GatewayConfig {
    /// Load every section from one TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load every section from the environment
    pub fn from_env() -> crate::Result<Self> {
        Ok(Self {
            relay: Config::from_env()?,
            quota: quota_ledger::Config::from_env()?,
            channels: channel_index::Config::from_env()?,
            adapters: adapters::Config::from_env()?,
        })
    }
}
