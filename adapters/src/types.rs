//! Adapter types

use crate::error::{Error, Result};
use bytes::Bytes;
use channel_index::{Channel, ChannelId, ProviderType};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// API family a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// `/v1/chat/completions`
    ChatCompletions,
    /// `/v1/completions`
    Completions,
    /// `/v1/embeddings`
    Embeddings,
    /// `/v1/moderations`
    Moderations,
    /// `/v1/images/generations`
    ImagesGenerations,
    /// `/v1/images/edits`
    ImagesEdits,
    /// `/v1/audio/speech`
    AudioSpeech,
    /// `/v1/audio/transcriptions`
    AudioTranscription,
    /// `/v1/audio/translations`
    AudioTranslation,
    /// `/v1/responses`
    Responses,
    /// `/v1/realtime`
    Realtime,
    /// `/v1/rerank`
    Rerank,
    /// Anything else
    Unknown,
}

impl RelayMode {
    /// Derive the mode from a request path
    pub fn from_path(path: &str) -> Self {
        let path = path.split('?').next().unwrap_or(path);
        let table: [(&str, RelayMode); 12] = [
            ("/v1/chat/completions", RelayMode::ChatCompletions),
            ("/v1/completions", RelayMode::Completions),
            ("/v1/embeddings", RelayMode::Embeddings),
            ("/v1/moderations", RelayMode::Moderations),
            ("/v1/images/generations", RelayMode::ImagesGenerations),
            ("/v1/images/edits", RelayMode::ImagesEdits),
            ("/v1/audio/speech", RelayMode::AudioSpeech),
            ("/v1/audio/transcriptions", RelayMode::AudioTranscription),
            ("/v1/audio/translations", RelayMode::AudioTranslation),
            ("/v1/responses", RelayMode::Responses),
            ("/v1/realtime", RelayMode::Realtime),
            ("/v1/rerank", RelayMode::Rerank),
        ];
        for (prefix, mode) in table {
            if path.starts_with(prefix) {
                return mode;
            }
        }
        // engine-style embedding paths, e.g. /v1/engines/{model}/embeddings
        if path.ends_with("embeddings") {
            return RelayMode::Embeddings;
        }
        RelayMode::Unknown
    }

    /// Canonical upstream path
    pub fn path(&self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::Moderations => "/v1/moderations",
            RelayMode::ImagesGenerations => "/v1/images/generations",
            RelayMode::ImagesEdits => "/v1/images/edits",
            RelayMode::AudioSpeech => "/v1/audio/speech",
            RelayMode::AudioTranscription => "/v1/audio/transcriptions",
            RelayMode::AudioTranslation => "/v1/audio/translations",
            RelayMode::Responses => "/v1/responses",
            RelayMode::Realtime => "/v1/realtime",
            RelayMode::Rerank => "/v1/rerank",
            RelayMode::Unknown => "",
        }
    }

    /// Whether the request body is JSON
    pub fn has_json_body(&self) -> bool {
        !matches!(
            self,
            RelayMode::AudioTranscription
                | RelayMode::AudioTranslation
                | RelayMode::ImagesEdits
                | RelayMode::Unknown
        )
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Everything an adaptor needs to know about one attempt
#[derive(Debug, Clone)]
pub struct RelayMeta {
    /// Request trace ID
    pub request_id: String,
    /// API family
    pub mode: RelayMode,
    /// Inbound path (used when the mode is unknown)
    pub request_path: String,
    /// Serving channel
    pub channel_id: ChannelId,
    /// Provider family
    pub provider: ProviderType,
    /// Effective base URL
    pub base_url: String,
    /// Upstream API key
    pub api_key: String,
    /// Provider API version (Azure)
    pub api_version: Option<String>,
    /// Client-facing model
    pub origin_model: String,
    /// Model sent upstream (after channel mapping)
    pub upstream_model: String,
    /// Client asked for a stream
    pub is_stream: bool,
    /// Prompt token estimate (fallback when the upstream omits usage)
    pub prompt_tokens: u32,
}

impl RelayMeta {
    /// Meta for an attempt on `channel`
    pub fn for_channel(
        channel: &Channel,
        request_id: impl Into<String>,
        request_path: impl Into<String>,
        origin_model: impl Into<String>,
    ) -> Self {
        let request_path = request_path.into();
        let origin_model = origin_model.into();
        Self {
            request_id: request_id.into(),
            mode: RelayMode::from_path(&request_path),
            request_path,
            channel_id: channel.id,
            provider: channel.provider,
            base_url: channel.effective_base_url().to_string(),
            api_key: channel.api_key.clone(),
            api_version: channel.api_version.clone(),
            upstream_model: channel.map_model(&origin_model).to_string(),
            origin_model,
            is_stream: false,
            prompt_tokens: 0,
        }
    }

    /// Set stream flag
    pub fn with_stream(mut self, is_stream: bool) -> Self {
        self.is_stream = is_stream;
        self
    }

    /// Set prompt estimate
    pub fn with_prompt_tokens(mut self, prompt_tokens: u32) -> Self {
        self.prompt_tokens = prompt_tokens;
        self
    }

    /// Path sent upstream
    pub fn upstream_path(&self) -> &str {
        match self.mode {
            RelayMode::Unknown => &self.request_path,
            mode => mode.path(),
        }
    }
}

enum ResponseBody {
    Buffered(Option<Bytes>),
    Chunks(VecDeque<std::result::Result<Bytes, String>>),
    Http {
        response: reqwest::Response,
        timeout_secs: u64,
    },
}

/// Upstream response before conversion
pub struct RawResponse {
    status: u16,
    content_type: Option<String>,
    body: ResponseBody,
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl RawResponse {
    /// Fully buffered body
    pub fn buffered(status: u16, content_type: Option<&str>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: content_type.map(str::to_string),
            body: ResponseBody::Buffered(Some(body.into())),
        }
    }

    /// Body delivered in chunks; an `Err` entry fails the read at that point
    pub fn chunked(
        status: u16,
        content_type: Option<&str>,
        chunks: impl IntoIterator<Item = std::result::Result<Bytes, String>>,
    ) -> Self {
        Self {
            status,
            content_type: content_type.map(str::to_string),
            body: ResponseBody::Chunks(chunks.into_iter().collect()),
        }
    }

    /// Live HTTP response read under the client's `timeout_secs` deadline
    pub fn http(response: reqwest::Response, timeout_secs: u64) -> Self {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self {
            status: response.status().as_u16(),
            content_type,
            body: ResponseBody::Http {
                response,
                timeout_secs,
            },
        }
    }

    /// HTTP status
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Content type header
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Whether the body is a server-sent event stream
    pub fn is_event_stream(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false)
    }

    /// Next body chunk, `None` at end of body
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.body {
            ResponseBody::Buffered(body) => Ok(body.take()),
            ResponseBody::Chunks(chunks) => match chunks.pop_front() {
                Some(Ok(chunk)) => Ok(Some(chunk)),
                Some(Err(message)) => Err(Error::Connection(message)),
                None => Ok(None),
            },
            ResponseBody::Http {
                response,
                timeout_secs,
            } => {
                let seconds = *timeout_secs;
                response.chunk().await.map_err(|e| {
                    if e.is_timeout() {
                        Error::Timeout {
                            seconds,
                            operation: "reading upstream body".to_string(),
                        }
                    } else {
                        Error::Connection(e.to_string())
                    }
                })
            }
        }
    }

    /// Read the whole body
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buf))
    }

    /// Turn a non-2xx response into [`Error::Upstream`]
    ///
    /// Understands the OpenAI `{"error": {...}}` shape, the Claude
    /// `{"type": "error", "error": {...}}` shape and plain-text bodies.
    pub async fn into_upstream_error(self) -> Error {
        let status_code = self.status;
        let body = match self.bytes().await {
            Ok(body) => body,
            Err(e) => return Error::upstream(status_code, format!("read response body failed: {}", e)),
        };

        let parsed: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
        let error = parsed.as_ref().and_then(|v| v.get("error"));

        let field = |name: &str| -> String {
            match error.and_then(|e| e.get(name)) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => String::new(),
            }
        };

        let mut message = field("message");
        if message.is_empty() {
            if let Some(serde_json::Value::String(s)) = error {
                message = s.clone();
            }
        }
        if message.is_empty() {
            let text = String::from_utf8_lossy(&body).trim().to_string();
            message = if text.is_empty() {
                format!("bad response status code {}", status_code)
            } else {
                text
            };
        }

        let mut error_type = field("type");
        if error_type.is_empty() {
            error_type = "upstream_error".to_string();
        }

        Error::Upstream {
            status_code,
            message,
            error_type,
            code: field("code"),
        }
    }
}
