//! Core types for the quota ledger
//!
//! Balances are integer quota units. Anything derived from ratios is
//! computed with `Decimal` and only rounded once, at the very end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Quota units (smallest billable unit is 1)
pub type Quota = i64;

/// User identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// API token identifier (a user may hold many tokens)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub i64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The credential a request is billed against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payer {
    /// Owning user
    pub user_id: UserId,

    /// Token used for the request
    pub token_id: TokenId,

    /// Token display name (for logs)
    pub token_name: String,

    /// Token has no allotment of its own
    pub token_unlimited: bool,
}

impl Payer {
    /// Payer with an unlimited token
    pub fn unlimited(user_id: UserId, token_id: TokenId) -> Self {
        Self {
            user_id,
            token_id,
            token_name: String::new(),
            token_unlimited: true,
        }
    }

    /// Payer whose token carries its own allotment
    pub fn limited(user_id: UserId, token_id: TokenId) -> Self {
        Self {
            user_id,
            token_id,
            token_name: String::new(),
            token_unlimited: false,
        }
    }

    /// Set token name
    pub fn with_token_name(mut self, name: impl Into<String>) -> Self {
        self.token_name = name.into();
        self
    }
}

/// Prompt-side token breakdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    /// Tokens served from the provider's prompt cache
    #[serde(default)]
    pub cached_tokens: u32,

    /// Image input tokens
    #[serde(default)]
    pub image_tokens: u32,

    /// Audio input tokens
    #[serde(default)]
    pub audio_tokens: u32,
}

/// Completion-side token breakdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    /// Audio output tokens
    #[serde(default)]
    pub audio_tokens: u32,

    /// Reasoning tokens (already included in completion tokens)
    #[serde(default)]
    pub reasoning_tokens: u32,
}

/// Built-in tools billed per call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltInTool {
    /// Web search
    WebSearch,
    /// File search
    FileSearch,
}

/// Billable tool invocations reported by the upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage {
    /// Tool kind
    pub tool: BuiltInTool,

    /// Number of calls
    pub call_count: u32,

    /// Search context size (`low` / `medium` / `high`), web search only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_context_size: Option<String>,
}

/// Usage returned by an adaptor after a successful call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens (including every prompt sub-category)
    #[serde(default)]
    pub prompt_tokens: u32,

    /// Completion tokens
    #[serde(default)]
    pub completion_tokens: u32,

    /// Total tokens as reported upstream
    #[serde(default)]
    pub total_tokens: u32,

    /// Prompt breakdown
    #[serde(default)]
    pub prompt_tokens_details: PromptTokensDetails,

    /// Completion breakdown
    #[serde(default)]
    pub completion_tokens_details: CompletionTokensDetails,

    /// Built-in tool calls
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolUsage>,
}

impl Usage {
    /// Plain prompt/completion usage
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            ..Default::default()
        }
    }

    /// Billable token count
    pub fn billable_tokens(&self) -> u64 {
        u64::from(self.prompt_tokens) + u64::from(self.completion_tokens)
    }

    /// Calls recorded for a tool
    pub fn tool(&self, tool: BuiltInTool) -> Option<&ToolUsage> {
        self.tool_calls
            .iter()
            .find(|t| t.tool == tool && t.call_count > 0)
    }
}

/// Provisional debit made before an upstream call
///
/// Not `Clone`: a reservation is closed exactly once, by
/// [`QuotaLedger::settle`](crate::QuotaLedger::settle) or
/// [`QuotaLedger::refund`](crate::QuotaLedger::refund).
#[derive(Debug)]
#[must_use = "a reservation must be settled or refunded"]
pub struct Reservation {
    id: Uuid,
    payer: Payer,
    amount: Quota,
    user_quota: Quota,
    created_at: DateTime<Utc>,
}

impl Reservation {
    pub(crate) fn new(payer: Payer, amount: Quota, user_quota: Quota) -> Self {
        Self {
            id: Uuid::now_v7(),
            payer,
            amount,
            user_quota,
            created_at: Utc::now(),
        }
    }

    /// Reservation ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Payer
    pub fn payer(&self) -> &Payer {
        &self.payer
    }

    /// Reserved amount (0 when trust-skipped)
    pub fn amount(&self) -> Quota {
        self.amount
    }

    /// User balance observed when reserving
    pub fn user_quota(&self) -> Quota {
        self.user_quota
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the reservation skipped the debit
    pub fn is_trusted(&self) -> bool {
        self.amount == 0
    }
}

/// Request facts recorded alongside a settlement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsumeContext {
    /// Request trace ID
    pub request_id: String,

    /// Channel that served the request
    pub channel_id: i64,

    /// Client-facing model name
    pub model_name: String,

    /// Group the request was billed under
    pub group: String,

    /// Streamed response
    pub is_stream: bool,

    /// Elapsed wall time
    pub use_time_seconds: i64,
}

/// Outcome of settling a reservation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    /// Reservation that was closed
    pub reservation_id: Uuid,

    /// Final charge
    pub charge: Quota,

    /// Amount reserved up front
    pub reserved: Quota,

    /// `charge - reserved`, applied to the balance
    pub delta: Quota,

    /// Upstream produced no tokens
    pub probable_upstream_error: bool,

    /// Audit entry for the usage log
    pub record: crate::audit::ConsumeLogRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billable_tokens() {
        let usage = Usage::new(120, 30);
        assert_eq!(usage.billable_tokens(), 150);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn test_tool_lookup_ignores_zero_calls() {
        let usage = Usage {
            tool_calls: vec![ToolUsage {
                tool: BuiltInTool::FileSearch,
                call_count: 0,
                search_context_size: None,
            }],
            ..Default::default()
        };
        assert!(usage.tool(BuiltInTool::FileSearch).is_none());
        assert!(usage.tool(BuiltInTool::WebSearch).is_none());
    }

    #[test]
    fn test_usage_deserializes_partial_json() {
        let usage: Usage =
            serde_json::from_str(r#"{"prompt_tokens": 10, "completion_tokens": 2}"#).unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.prompt_tokens_details, PromptTokensDetails::default());
    }
}
