//! Per-request relay state

use adapters::RelayMode;
use bytes::Bytes;
use channel_index::{Channel, ChannelId};
use quota_ledger::{Payer, PriceSnapshot, Quota, Usage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Client request as received
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// API path, e.g. `/v1/chat/completions`
    pub path: String,
    /// Buffered body, re-sent verbatim to every attempt
    pub body: Bytes,
    /// Client asked for a stream
    pub is_stream: bool,
    /// Requested completion budget (0 when unset)
    pub max_tokens: u32,
}

impl InboundRequest {
    /// Request with no stream flag or token budget
    pub fn new(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            body: body.into(),
            is_stream: false,
            max_tokens: 0,
        }
    }

    /// Request with `stream` and `max_tokens` read from a JSON body
    pub fn from_json(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let mut request = Self::new(path, body);
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&request.body) {
            request.is_stream = value
                .get("stream")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            request.max_tokens = ["max_tokens", "max_completion_tokens", "max_output_tokens"]
                .iter()
                .find_map(|key| value.get(*key).and_then(serde_json::Value::as_u64))
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .unwrap_or(0);
        }
        request
    }

    /// Set stream flag
    pub fn with_stream(mut self, is_stream: bool) -> Self {
        self.is_stream = is_stream;
        self
    }

    /// Set completion budget
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// API family
    pub fn mode(&self) -> RelayMode {
        RelayMode::from_path(&self.path)
    }
}

/// What authentication and distribution resolved for a request
#[derive(Debug, Clone)]
pub struct Route {
    /// Request trace ID
    pub request_id: String,
    /// Billed user and token
    pub payer: Payer,
    /// Membership group
    pub group: String,
    /// Client-facing model
    pub model: String,
    /// Channel for the first attempt
    pub channel: Arc<Channel>,
    /// Client pinned the channel; never fail over
    pub pinned: bool,
    /// Prompt estimate already computed upstream of the relay
    pub prompt_tokens: Option<u32>,
    /// Whole-request deadline
    pub deadline: Option<Duration>,
}

impl Route {
    /// Route starting on `channel`
    pub fn new(
        request_id: impl Into<String>,
        payer: Payer,
        group: impl Into<String>,
        model: impl Into<String>,
        channel: Arc<Channel>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            payer,
            group: group.into(),
            model: model.into(),
            channel,
            pinned: false,
            prompt_tokens: None,
            deadline: None,
        }
    }

    /// Pin the channel
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Supply the prompt estimate
    pub fn with_prompt_tokens(mut self, prompt_tokens: u32) -> Self {
        self.prompt_tokens = Some(prompt_tokens);
        self
    }

    /// Bound the whole request
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// State owned by one in-flight request
#[derive(Debug)]
pub struct RelayContext {
    /// Request trace ID
    pub request_id: String,
    /// Client-facing model
    pub origin_model: String,
    /// Model sent upstream on the current attempt
    pub upstream_model: String,
    /// Billed user and token
    pub payer: Payer,
    /// Membership group
    pub group: String,
    /// Channel pinned by the client
    pub pinned: bool,
    /// Streamed response
    pub is_stream: bool,
    /// API family
    pub mode: RelayMode,
    /// Prompt estimate
    pub prompt_tokens: u32,
    /// Prices resolved once for the request
    pub prices: PriceSnapshot,
    started_at: Instant,
    deadline: Option<Instant>,
    used_channels: Vec<ChannelId>,
}

impl RelayContext {
    /// Fresh context; the deadline starts counting now
    pub fn new(
        request: &InboundRequest,
        route: &Route,
        prompt_tokens: u32,
        prices: PriceSnapshot,
        deadline: Option<Duration>,
    ) -> Self {
        let started_at = Instant::now();
        Self {
            request_id: route.request_id.clone(),
            origin_model: route.model.clone(),
            upstream_model: route.model.clone(),
            payer: route.payer.clone(),
            group: route.group.clone(),
            pinned: route.pinned,
            is_stream: request.is_stream,
            mode: request.mode(),
            prompt_tokens,
            prices,
            started_at,
            deadline: deadline.map(|d| started_at + d),
            used_channels: Vec::new(),
        }
    }

    /// Record a channel about to be attempted
    pub fn add_used_channel(&mut self, channel_id: ChannelId) {
        self.used_channels.push(channel_id);
    }

    /// Channels attempted so far, in order
    pub fn used_channels(&self) -> &[ChannelId] {
        &self.used_channels
    }

    /// Trail like `3->7->9`
    pub fn retry_trail(&self) -> String {
        self.used_channels
            .iter()
            .map(ChannelId::to_string)
            .collect::<Vec<_>>()
            .join("->")
    }

    /// Absolute deadline
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether no further attempt may start
    pub fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Time since the request started
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Outcome of a successful request
#[derive(Debug, Clone)]
pub struct RelaySummary {
    /// Request trace ID
    pub request_id: String,
    /// Channel that served it
    pub channel_id: ChannelId,
    /// Channels attempted, in order
    pub attempts: Vec<ChannelId>,
    /// Upstream usage
    pub usage: Usage,
    /// Final charge
    pub charge: Quota,
}

/// Buffered response
#[derive(Debug, Clone)]
pub struct RelayResponse {
    /// Request outcome
    pub summary: RelaySummary,
    /// Response content type
    pub content_type: Option<String>,
    /// Response body
    pub body: Bytes,
}
