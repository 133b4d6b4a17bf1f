//! Usage and error log records
//!
//! Consume records are produced by [`QuotaLedger::settle`](crate::QuotaLedger::settle);
//! error records by the relay when a channel fails. Both go to a
//! [`UsageLogSink`], which is written off the request path.

use crate::error::Result;
use crate::types::{Quota, TokenId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One settled request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLogRecord {
    /// Request trace ID
    pub request_id: String,
    /// Billed user
    pub user_id: UserId,
    /// Billed token
    pub token_id: TokenId,
    /// Token display name
    pub token_name: String,
    /// Serving channel
    pub channel_id: i64,
    /// Client-facing model
    pub model_name: String,
    /// Billing group
    pub group: String,
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Final charge
    pub quota: Quota,
    /// Price summary
    pub content: String,
    /// Elapsed seconds
    pub use_time_seconds: i64,
    /// Streamed response
    pub is_stream: bool,
    /// Structured price breakdown
    pub other: serde_json::Value,
    /// Record time
    pub created_at: DateTime<Utc>,
}

/// One failed channel attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogRecord {
    /// Request trace ID
    pub request_id: String,
    /// Billed user
    pub user_id: UserId,
    /// Billed token
    pub token_id: TokenId,
    /// Token display name
    pub token_name: String,
    /// Failing channel
    pub channel_id: i64,
    /// Channel display name
    pub channel_name: String,
    /// Provider family
    pub provider: String,
    /// Client-facing model
    pub model_name: String,
    /// Billing group
    pub group: String,
    /// HTTP status
    pub status_code: u16,
    /// Structured error type
    pub error_type: String,
    /// Structured error code
    pub error_code: String,
    /// Error text
    pub message: String,
    /// Record time
    pub created_at: DateTime<Utc>,
}

/// Destination for usage and error records
#[async_trait]
pub trait UsageLogSink: Send + Sync {
    /// Persist a consume record
    async fn record_consume(&self, record: ConsumeLogRecord) -> Result<()>;

    /// Persist an error record
    async fn record_error(&self, record: ErrorLogRecord) -> Result<()>;
}

/// Sink that keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryUsageLog {
    consumes: Mutex<Vec<ConsumeLogRecord>>,
    errors: Mutex<Vec<ErrorLogRecord>>,
}

impl MemoryUsageLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume records so far
    pub fn consumes(&self) -> Vec<ConsumeLogRecord> {
        self.consumes.lock().clone()
    }

    /// Error records so far
    pub fn errors(&self) -> Vec<ErrorLogRecord> {
        self.errors.lock().clone()
    }
}

#[async_trait]
impl UsageLogSink for MemoryUsageLog {
    async fn record_consume(&self, record: ConsumeLogRecord) -> Result<()> {
        self.consumes.lock().push(record);
        Ok(())
    }

    async fn record_error(&self, record: ErrorLogRecord) -> Result<()> {
        self.errors.lock().push(record);
        Ok(())
    }
}

/// Sink that emits records as structured log events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageLog;

#[async_trait]
impl UsageLogSink for TracingUsageLog {
    async fn record_consume(&self, record: ConsumeLogRecord) -> Result<()> {
        info!(
            target: "usage",
            request_id = %record.request_id,
            user_id = %record.user_id,
            channel_id = record.channel_id,
            model = %record.model_name,
            prompt_tokens = record.prompt_tokens,
            completion_tokens = record.completion_tokens,
            quota = record.quota,
            "{}",
            record.content
        );
        Ok(())
    }

    async fn record_error(&self, record: ErrorLogRecord) -> Result<()> {
        warn!(
            target: "usage",
            request_id = %record.request_id,
            user_id = %record.user_id,
            channel_id = record.channel_id,
            status = record.status_code,
            error_type = %record.error_type,
            "{}",
            record.message
        );
        Ok(())
    }
}
