//! Channel model

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Stable channel identifier
pub type ChannelId = i64;

/// Upstream provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// OpenAI
    #[serde(rename = "openai")]
    OpenAi,
    /// Azure OpenAI
    Azure,
    /// Anthropic
    Anthropic,
    /// Google Gemini
    Gemini,
    /// DeepSeek
    #[serde(rename = "deepseek")]
    DeepSeek,
    /// Local Ollama
    Ollama,
    /// Any OpenAI-compatible endpoint
    Custom,
}

impl ProviderType {
    /// All provider types
    pub const ALL: [ProviderType; 7] = [
        ProviderType::OpenAi,
        ProviderType::Azure,
        ProviderType::Anthropic,
        ProviderType::Gemini,
        ProviderType::DeepSeek,
        ProviderType::Ollama,
        ProviderType::Custom,
    ];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "openai",
            ProviderType::Azure => "azure",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Gemini => "gemini",
            ProviderType::DeepSeek => "deepseek",
            ProviderType::Ollama => "ollama",
            ProviderType::Custom => "custom",
        }
    }

    /// Base URL used when the channel does not set one
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "https://api.openai.com",
            ProviderType::Anthropic => "https://api.anthropic.com",
            ProviderType::Gemini => "https://generativelanguage.googleapis.com",
            ProviderType::DeepSeek => "https://api.deepseek.com",
            ProviderType::Ollama => "http://localhost:11434",
            ProviderType::Azure | ProviderType::Custom => "",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::UnknownProvider(s.to_string()))
    }
}

/// Channel status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Serving traffic
    Enabled,
    /// Disabled by an operator
    ManuallyDisabled,
    /// Disabled by the auto-ban policy
    AutoDisabled,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelStatus::Enabled => "enabled",
            ChannelStatus::ManuallyDisabled => "manually_disabled",
            ChannelStatus::AutoDisabled => "auto_disabled",
        };
        f.write_str(s)
    }
}

/// One upstream credential/endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Stable ID
    pub id: ChannelId,

    /// Provider family (selects the adaptor)
    pub provider: ProviderType,

    /// Display name
    pub name: String,

    /// Status
    pub status: ChannelStatus,

    /// Failures may disable this channel automatically
    #[serde(default = "default_true")]
    pub auto_ban: bool,

    /// Selection weight
    #[serde(default)]
    pub priority: u32,

    /// Groups served
    #[serde(default)]
    pub groups: Vec<String>,

    /// Models served
    #[serde(default)]
    pub models: Vec<String>,

    /// Endpoint base URL (empty: provider default)
    #[serde(default)]
    pub base_url: String,

    /// Upstream API key
    #[serde(default)]
    pub api_key: String,

    /// Client model → upstream model
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_mapping: HashMap<String, String>,

    /// Upstream status → reported status (keys are decimal status codes)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub status_code_mapping: HashMap<String, u16>,

    /// Fields merged into every converted payload
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub param_override: serde_json::Map<String, serde_json::Value>,

    /// Provider-specific setting (e.g. Azure API version)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Channel {
    /// Enabled channel with no groups or models yet
    pub fn new(id: ChannelId, provider: ProviderType, name: impl Into<String>) -> Self {
        Self {
            id,
            provider,
            name: name.into(),
            status: ChannelStatus::Enabled,
            auto_ban: true,
            priority: 0,
            groups: Vec::new(),
            models: Vec::new(),
            base_url: String::new(),
            api_key: String::new(),
            model_mapping: HashMap::new(),
            status_code_mapping: HashMap::new(),
            param_override: serde_json::Map::new(),
            api_version: None,
        }
    }

    /// Set groups
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// Set models
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Set selection weight
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set status
    pub fn with_status(mut self, status: ChannelStatus) -> Self {
        self.status = status;
        self
    }

    /// Set base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set API key
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Set auto-ban flag
    pub fn with_auto_ban(mut self, auto_ban: bool) -> Self {
        self.auto_ban = auto_ban;
        self
    }

    /// Add a model mapping
    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }

    /// Add a status-code mapping
    pub fn with_status_code_mapping(mut self, from: u16, to: u16) -> Self {
        self.status_code_mapping.insert(from.to_string(), to);
        self
    }

    /// Whether the channel serves traffic
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    /// Whether (group, model) is in the satisfaction set
    pub fn supports(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|g| g == group) && self.models.iter().any(|m| m == model)
    }

    /// Upstream model name for a client model
    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        match self.model_mapping.get(model) {
            Some(mapped) if !mapped.is_empty() => mapped.as_str(),
            _ => model,
        }
    }

    /// Status to report for an upstream status
    pub fn map_status(&self, status: u16) -> u16 {
        self.status_code_mapping
            .get(&status.to_string())
            .copied()
            .unwrap_or(status)
    }

    /// Configured base URL or the provider default
    pub fn effective_base_url(&self) -> &str {
        if self.base_url.is_empty() {
            self.provider.default_base_url()
        } else {
            self.base_url.trim_end_matches('/')
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip_names() {
        for provider in ProviderType::ALL {
            assert_eq!(provider.as_str().parse::<ProviderType>().unwrap(), provider);
        }
        assert!("nope".parse::<ProviderType>().is_err());
    }

    #[test]
    fn test_provider_serde_names() {
        let json = serde_json::to_string(&ProviderType::OpenAi).unwrap();
        assert_eq!(json, "\"openai\"");
        let parsed: ProviderType = serde_json::from_str("\"deepseek\"").unwrap();
        assert_eq!(parsed, ProviderType::DeepSeek);
    }

    #[test]
    fn test_supports_is_cross_product() {
        let channel = Channel::new(1, ProviderType::OpenAi, "a")
            .with_groups(["default", "vip"])
            .with_models(["gpt-4o", "gpt-4o-mini"]);
        assert!(channel.supports("vip", "gpt-4o-mini"));
        assert!(!channel.supports("svip", "gpt-4o"));
        assert!(!channel.supports("default", "o1"));
    }

    #[test]
    fn test_model_mapping() {
        let channel = Channel::new(1, ProviderType::OpenAi, "a")
            .with_model_mapping("gpt-4", "gpt-4-0613")
            .with_model_mapping("blank", "");
        assert_eq!(channel.map_model("gpt-4"), "gpt-4-0613");
        assert_eq!(channel.map_model("blank"), "blank");
        assert_eq!(channel.map_model("other"), "other");
    }

    #[test]
    fn test_status_mapping() {
        let channel = Channel::new(1, ProviderType::OpenAi, "a").with_status_code_mapping(400, 500);
        assert_eq!(channel.map_status(400), 500);
        assert_eq!(channel.map_status(429), 429);
    }

    #[test]
    fn test_effective_base_url() {
        let channel = Channel::new(1, ProviderType::OpenAi, "a");
        assert_eq!(channel.effective_base_url(), "https://api.openai.com");
        let channel = channel.with_base_url("http://proxy.local/");
        assert_eq!(channel.effective_base_url(), "http://proxy.local");
    }
}
