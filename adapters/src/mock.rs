//! Scripted in-process upstream
//!
//! Each channel gets a queue of [`MockOutcome`]s; every attempt pops one.
//! Bodies are OpenAI-shaped, so responses go through the same conversion
//! code as a real OpenAI-compatible upstream.

use crate::adaptor::{Adaptor, AdaptorFactory};
use crate::error::{Error, Result};
use crate::openai::{json_response, stream_response};
use crate::sink::ResponseSink;
use crate::types::{RawResponse, RelayMeta};
use async_trait::async_trait;
use bytes::Bytes;
use channel_index::ChannelId;
use parking_lot::Mutex;
use quota_ledger::Usage;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// What the mock upstream does for one attempt
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// 200 with a chat completion body
    Success {
        /// Reported usage
        usage: Usage,
    },
    /// 200 event stream, one delta per chunk
    Stream {
        /// Delta texts
        chunks: Vec<String>,
        /// Usage appended as a final chunk
        usage: Option<Usage>,
    },
    /// Event stream that breaks after its chunks
    StreamThenFail {
        /// Delta texts sent before the failure
        chunks: Vec<String>,
    },
    /// Non-2xx answer
    Upstream {
        /// HTTP status
        status: u16,
        /// Error message
        message: String,
        /// Error type
        error_type: String,
        /// Error code
        code: String,
    },
    /// Upstream timed out
    Timeout,
    /// Connection refused
    Connection,
    /// Never answers
    Hang,
}

impl MockOutcome {
    /// Successful completion with the given token counts
    pub fn success(prompt_tokens: u32, completion_tokens: u32) -> Self {
        MockOutcome::Success {
            usage: Usage::new(prompt_tokens, completion_tokens),
        }
    }

    /// Stream of deltas ending with a usage chunk
    pub fn stream<I, S>(chunks: I, prompt_tokens: u32, completion_tokens: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MockOutcome::Stream {
            chunks: chunks.into_iter().map(Into::into).collect(),
            usage: Some(Usage::new(prompt_tokens, completion_tokens)),
        }
    }

    /// Upstream error with a status and message
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        MockOutcome::Upstream {
            status,
            message: message.into(),
            error_type: "upstream_error".to_string(),
            code: String::new(),
        }
    }
}

/// One recorded attempt
#[derive(Debug, Clone)]
pub struct MockCall {
    /// Channel the attempt went to
    pub channel_id: ChannelId,
    /// Model sent upstream
    pub upstream_model: String,
    /// Payload after conversion and overrides
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct MockState {
    scripts: Mutex<HashMap<ChannelId, VecDeque<MockOutcome>>>,
    fallback: Mutex<HashMap<ChannelId, MockOutcome>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockState {
    fn next(&self, channel_id: ChannelId) -> MockOutcome {
        if let Some(outcome) = self
            .scripts
            .lock()
            .get_mut(&channel_id)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        self.fallback
            .lock()
            .get(&channel_id)
            .cloned()
            .unwrap_or_else(|| MockOutcome::success(10, 10))
    }
}

/// Factory for scripted adaptors
#[derive(Debug, Clone, Default)]
pub struct MockAdaptorFactory {
    state: Arc<MockState>,
}

impl MockAdaptorFactory {
    /// Empty script; unscripted attempts succeed
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an outcome for a channel
    pub fn push(&self, channel_id: ChannelId, outcome: MockOutcome) -> &Self {
        self.state
            .scripts
            .lock()
            .entry(channel_id)
            .or_default()
            .push_back(outcome);
        self
    }

    /// Outcome used once the channel's queue is empty
    pub fn set_fallback(&self, channel_id: ChannelId, outcome: MockOutcome) -> &Self {
        self.state.fallback.lock().insert(channel_id, outcome);
        self
    }

    /// Every attempt so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().clone()
    }

    /// Channel IDs attempted, in order
    pub fn attempted_channels(&self) -> Vec<ChannelId> {
        self.state.calls.lock().iter().map(|c| c.channel_id).collect()
    }
}

impl AdaptorFactory for MockAdaptorFactory {
    fn create(&self) -> Box<dyn Adaptor> {
        Box::new(MockAdaptor {
            state: self.state.clone(),
        })
    }
}

/// Adaptor answering from a [`MockAdaptorFactory`] script
#[derive(Debug)]
pub struct MockAdaptor {
    state: Arc<MockState>,
}

fn sse(value: &Value) -> std::result::Result<Bytes, String> {
    Ok(Bytes::from(format!("data: {}\n\n", value)))
}

fn delta_chunk(meta: &RelayMeta, text: &str) -> Value {
    json!({
        "id": format!("chatcmpl-{}", meta.request_id),
        "object": "chat.completion.chunk",
        "model": meta.upstream_model,
        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}]
    })
}

fn usage_json(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
    })
}

#[async_trait]
impl Adaptor for MockAdaptor {
    fn name(&self) -> &str {
        "mock"
    }

    fn init(&mut self, _meta: &RelayMeta) {}

    fn convert_request(&mut self, meta: &RelayMeta, request: &Bytes) -> Result<Bytes> {
        if !meta.mode.has_json_body() {
            return Ok(request.clone());
        }
        let mut value: Value = serde_json::from_slice(request)
            .map_err(|e| Error::InvalidRequest(format!("request body is not valid JSON: {}", e)))?;
        if let Some(object) = value.as_object_mut() {
            object.insert("model".to_string(), Value::String(meta.upstream_model.clone()));
        }
        Ok(Bytes::from(serde_json::to_vec(&value)?))
    }

    async fn send_request(&self, meta: &RelayMeta, payload: Bytes) -> Result<RawResponse> {
        let outcome = self.state.next(meta.channel_id);
        self.state.calls.lock().push(MockCall {
            channel_id: meta.channel_id,
            upstream_model: meta.upstream_model.clone(),
            payload,
        });

        match outcome {
            MockOutcome::Success { usage } => {
                let body = json!({
                    "id": format!("chatcmpl-{}", meta.request_id),
                    "object": "chat.completion",
                    "model": meta.upstream_model,
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "ok"},
                        "finish_reason": "stop"
                    }],
                    "usage": usage_json(&usage),
                });
                Ok(RawResponse::buffered(
                    200,
                    Some("application/json"),
                    body.to_string(),
                ))
            }
            MockOutcome::Stream { chunks, usage } => {
                let mut events: Vec<_> = chunks.iter().map(|t| sse(&delta_chunk(meta, t))).collect();
                if let Some(usage) = usage {
                    events.push(sse(&json!({"choices": [], "usage": usage_json(&usage)})));
                }
                events.push(Ok(Bytes::from_static(b"data: [DONE]\n\n")));
                Ok(RawResponse::chunked(200, Some("text/event-stream"), events))
            }
            MockOutcome::StreamThenFail { chunks } => {
                let mut events: Vec<_> = chunks.iter().map(|t| sse(&delta_chunk(meta, t))).collect();
                events.push(Err("upstream reset the stream".to_string()));
                Ok(RawResponse::chunked(200, Some("text/event-stream"), events))
            }
            MockOutcome::Upstream {
                status,
                message,
                error_type,
                code,
            } => {
                let body = json!({"error": {"message": message, "type": error_type, "code": code}});
                Ok(RawResponse::buffered(
                    status,
                    Some("application/json"),
                    body.to_string(),
                ))
            }
            MockOutcome::Timeout => Err(Error::Timeout {
                seconds: 0,
                operation: "upstream request".to_string(),
            }),
            MockOutcome::Connection => Err(Error::Connection("connection refused".to_string())),
            MockOutcome::Hang => {
                std::future::pending::<()>().await;
                Err(Error::Connection("unreachable".to_string()))
            }
        }
    }

    async fn convert_response(
        &self,
        meta: &RelayMeta,
        response: RawResponse,
        sink: &mut dyn ResponseSink,
    ) -> Result<Usage> {
        if meta.is_stream || response.is_event_stream() {
            stream_response(meta, response, sink, None).await
        } else {
            json_response(meta, response, sink, None).await
        }
    }
}
