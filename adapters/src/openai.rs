//! OpenAI-compatible adaptor
//!
//! Serves OpenAI, Azure OpenAI, DeepSeek, Ollama and any custom endpoint
//! speaking the same wire format. Bodies are forwarded as-is apart from
//! the model name and, for streams, a request to include usage.

use crate::adaptor::{Adaptor, AdaptorFactory};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::{record_request, ADAPTOR_STREAM_CHUNKS_TOTAL};
use crate::sink::ResponseSink;
use crate::types::{RawResponse, RelayMeta, RelayMode};
use crate::usage::{add_tool, count_tool_calls, estimate_tokens, parse_usage, SseParser};
use async_trait::async_trait;
use bytes::Bytes;
use channel_index::ProviderType;
use quota_ledger::{BuiltInTool, Usage};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Azure API version used when the channel does not set one
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// Builds [`OpenAiAdaptor`]s sharing one HTTP client
#[derive(Debug, Clone)]
pub struct OpenAiAdaptorFactory {
    client: Client,
    config: Arc<Config>,
}

impl OpenAiAdaptorFactory {
    /// Create a factory with its own connection pool
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }
}

impl AdaptorFactory for OpenAiAdaptorFactory {
    fn create(&self) -> Box<dyn Adaptor> {
        Box::new(OpenAiAdaptor {
            client: self.client.clone(),
            config: self.config.clone(),
            url: String::new(),
            search_context_size: None,
        })
    }
}

/// OpenAI-compatible adaptor
#[derive(Debug)]
pub struct OpenAiAdaptor {
    client: Client,
    config: Arc<Config>,
    url: String,
    search_context_size: Option<String>,
}

/// Full upstream URL for an attempt
pub fn request_url(meta: &RelayMeta) -> String {
    match meta.provider {
        ProviderType::Azure => {
            let path = meta.upstream_path().trim_start_matches("/v1");
            let version = meta
                .api_version
                .as_deref()
                .unwrap_or(DEFAULT_AZURE_API_VERSION);
            // deployment names cannot contain dots
            let deployment = meta.upstream_model.replace('.', "");
            format!(
                "{}/openai/deployments/{}{}?api-version={}",
                meta.base_url, deployment, path, version
            )
        }
        _ => format!("{}{}", meta.base_url, meta.upstream_path()),
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn name(&self) -> &str {
        "openai"
    }

    fn init(&mut self, meta: &RelayMeta) {
        self.url = request_url(meta);
        self.search_context_size = None;
    }

    fn convert_request(&mut self, meta: &RelayMeta, request: &Bytes) -> Result<Bytes> {
        if !meta.mode.has_json_body() {
            return Ok(request.clone());
        }

        let mut value: Value = serde_json::from_slice(request)
            .map_err(|e| Error::InvalidRequest(format!("request body is not valid JSON: {}", e)))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| Error::InvalidRequest("request body must be a JSON object".to_string()))?;

        object.insert("model".to_string(), Value::String(meta.upstream_model.clone()));
        self.search_context_size = search_context_size(object);

        let wants_usage = matches!(meta.mode, RelayMode::ChatCompletions | RelayMode::Completions);
        if meta.is_stream && wants_usage && self.config.force_stream_usage {
            let options = object
                .entry("stream_options")
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Some(options) = options.as_object_mut() {
                options.insert("include_usage".to_string(), Value::Bool(true));
            }
        }

        Ok(Bytes::from(serde_json::to_vec(&value)?))
    }

    async fn send_request(&self, meta: &RelayMeta, payload: Bytes) -> Result<RawResponse> {
        let url = if self.url.is_empty() {
            request_url(meta)
        } else {
            self.url.clone()
        };

        let mut builder = self.client.post(&url).body(payload);
        builder = match meta.provider {
            ProviderType::Azure => builder.header("api-key", &meta.api_key),
            _ => builder.bearer_auth(&meta.api_key),
        };
        if meta.mode.has_json_body() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        if meta.is_stream {
            builder = builder.header(ACCEPT, "text/event-stream");
        }

        debug!(request_id = %meta.request_id, channel_id = meta.channel_id, %url, "sending upstream request");
        let start = Instant::now();
        let result = builder.send().await;
        let provider = meta.provider.as_str();

        match result {
            Ok(response) => {
                record_request(provider, Some(response.status().as_u16()), start.elapsed());
                Ok(RawResponse::http(
                    response,
                    self.config.request_timeout_secs,
                ))
            }
            Err(e) => {
                record_request(provider, None, start.elapsed());
                Err(Error::from_transport(e, self.config.request_timeout_secs))
            }
        }
    }

    async fn convert_response(
        &self,
        meta: &RelayMeta,
        response: RawResponse,
        sink: &mut dyn ResponseSink,
    ) -> Result<Usage> {
        let context = self.search_context_size.as_deref();
        if meta.is_stream || response.is_event_stream() {
            stream_response(meta, response, sink, context).await
        } else {
            json_response(meta, response, sink, context).await
        }
    }
}

fn search_context_size(object: &serde_json::Map<String, Value>) -> Option<String> {
    let from_options = object
        .get("web_search_options")
        .and_then(|o| o.get("search_context_size"))
        .and_then(Value::as_str);
    let from_tools = || {
        object
            .get("tools")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|t| {
                t.get("type")
                    .and_then(Value::as_str)
                    .map(|ty| ty.starts_with("web_search"))
                    .unwrap_or(false)
            })
            .and_then(|t| t.get("search_context_size"))
            .and_then(Value::as_str)
    };
    from_options.or_else(from_tools).map(str::to_string)
}

fn finish_usage(meta: &RelayMeta, usage: &mut Usage, context: Option<&str>) {
    // search-preview chat models bill one search per request
    if meta.upstream_model.ends_with("search-preview") && usage.tool(BuiltInTool::WebSearch).is_none()
    {
        add_tool(usage, BuiltInTool::WebSearch, 1, context);
    }
}

/// Forward a buffered JSON (or binary) body and read its usage
pub async fn json_response(
    meta: &RelayMeta,
    response: RawResponse,
    sink: &mut dyn ResponseSink,
    context: Option<&str>,
) -> Result<Usage> {
    let content_type = response
        .content_type()
        .unwrap_or("application/json")
        .to_string();
    let body = response.bytes().await?;
    let value: Option<Value> = serde_json::from_slice(&body).ok();

    sink.set_content_type(&content_type);
    sink.write(body).await?;

    let mut usage = match value.as_ref().and_then(parse_usage) {
        Some(usage) => usage,
        None => {
            debug!(request_id = %meta.request_id, "response carries no usage, estimating");
            Usage::new(meta.prompt_tokens, 0)
        }
    };
    if let Some(value) = &value {
        count_tool_calls(value, context, &mut usage);
    }
    finish_usage(meta, &mut usage, context);
    Ok(usage)
}

#[derive(Default)]
struct StreamState {
    usage: Option<Usage>,
    text: String,
    completed: Option<Value>,
}

impl StreamState {
    fn observe(&mut self, payload: &str) {
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "skipping unparsable stream event");
                return;
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("response.completed") => {
                if let Some(response) = value.get("response") {
                    if let Some(usage) = parse_usage(response) {
                        self.usage = Some(usage);
                    }
                    self.completed = Some(response.clone());
                }
                return;
            }
            Some("response.output_text.delta") => {
                if let Some(delta) = value.get("delta").and_then(Value::as_str) {
                    self.text.push_str(delta);
                }
                return;
            }
            _ => {}
        }

        if let Some(usage) = parse_usage(&value) {
            self.usage = Some(usage);
        }
        if let Some(choices) = value.get("choices").and_then(Value::as_array) {
            for choice in choices {
                let delta = choice
                    .get("delta")
                    .and_then(|d| d.get("content"))
                    .or_else(|| choice.get("text"));
                if let Some(text) = delta.and_then(Value::as_str) {
                    self.text.push_str(text);
                }
            }
        }
    }
}

/// Forward a server-sent event stream chunk by chunk
///
/// Usage comes from the last event that carries it; without one, the
/// completion is estimated from the streamed text.
pub async fn stream_response(
    meta: &RelayMeta,
    mut response: RawResponse,
    sink: &mut dyn ResponseSink,
    context: Option<&str>,
) -> Result<Usage> {
    sink.set_content_type("text/event-stream");
    let chunks = ADAPTOR_STREAM_CHUNKS_TOTAL.with_label_values(&[meta.provider.as_str()]);

    let mut parser = SseParser::new();
    let mut state = StreamState::default();
    while let Some(chunk) = response.next_chunk().await? {
        for payload in parser.push(&chunk) {
            state.observe(&payload);
        }
        sink.write(chunk).await?;
        chunks.inc();
    }
    if let Some(payload) = parser.finish() {
        state.observe(&payload);
    }

    let mut usage = match state.usage {
        Some(usage) => usage,
        None => {
            debug!(request_id = %meta.request_id, "stream carried no usage, estimating");
            Usage::new(meta.prompt_tokens, estimate_tokens(&state.text))
        }
    };
    if let Some(completed) = &state.completed {
        count_tool_calls(completed, context, &mut usage);
    }
    finish_usage(meta, &mut usage, context);
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BufferSink;
    use channel_index::Channel;
    use serde_json::json;

    fn meta(provider: ProviderType, path: &str) -> RelayMeta {
        let channel = Channel::new(1, provider, "c")
            .with_base_url("https://upstream.test")
            .with_api_key("sk-test")
            .with_model_mapping("gpt-4", "gpt-4.1");
        RelayMeta::for_channel(&channel, "req-1", path, "gpt-4")
    }

    fn adaptor() -> Box<dyn Adaptor> {
        OpenAiAdaptorFactory::new(Config::default()).unwrap().create()
    }

    #[test]
    fn test_request_url() {
        let m = meta(ProviderType::OpenAi, "/v1/chat/completions");
        assert_eq!(request_url(&m), "https://upstream.test/v1/chat/completions");

        let m = meta(ProviderType::Azure, "/v1/chat/completions");
        assert_eq!(
            request_url(&m),
            "https://upstream.test/openai/deployments/gpt-41/chat/completions?api-version=2024-10-21"
        );
    }

    #[test]
    fn test_convert_request_maps_model_and_stream_usage() {
        let mut adaptor = adaptor();
        let m = meta(ProviderType::OpenAi, "/v1/chat/completions").with_stream(true);
        adaptor.init(&m);

        let body = Bytes::from(json!({"model": "gpt-4", "stream": true, "messages": []}).to_string());
        let out = adaptor.convert_request(&m, &body).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["model"], json!("gpt-4.1"));
        assert_eq!(value["stream_options"]["include_usage"], json!(true));
    }

    #[test]
    fn test_convert_request_rejects_bad_json() {
        let mut adaptor = adaptor();
        let m = meta(ProviderType::OpenAi, "/v1/chat/completions");
        let err = adaptor
            .convert_request(&m, &Bytes::from_static(b"{oops"))
            .unwrap_err();
        assert!(err.is_local());
    }

    #[test]
    fn test_search_context_size_sources() {
        let body = json!({"web_search_options": {"search_context_size": "low"}});
        assert_eq!(
            search_context_size(body.as_object().unwrap()).as_deref(),
            Some("low")
        );
        let body = json!({"tools": [{"type": "web_search_preview", "search_context_size": "high"}]});
        assert_eq!(
            search_context_size(body.as_object().unwrap()).as_deref(),
            Some("high")
        );
    }

    #[tokio::test]
    async fn test_stream_usage_from_last_chunk() {
        let m = meta(ProviderType::OpenAi, "/v1/chat/completions").with_stream(true);
        let events = vec![
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            )),
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2,\"total_tokens\":11}}\n\n",
            )),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let response = RawResponse::chunked(200, Some("text/event-stream"), events);
        let mut sink = BufferSink::new();

        let usage = stream_response(&m, response, &mut sink, None).await.unwrap();
        assert_eq!(usage.prompt_tokens, 9);
        assert_eq!(usage.completion_tokens, 2);

        let (content_type, body) = sink.into_parts();
        assert_eq!(content_type.as_deref(), Some("text/event-stream"));
        assert!(body.ends_with(b"data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_stream_without_usage_is_estimated() {
        let m = meta(ProviderType::OpenAi, "/v1/chat/completions")
            .with_stream(true)
            .with_prompt_tokens(20);
        let events = vec![Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"abcdefgh\"}}]}\n\n",
        ))];
        let response = RawResponse::chunked(200, Some("text/event-stream"), events);
        let usage = stream_response(&m, response, &mut BufferSink::new(), None)
            .await
            .unwrap();
        assert_eq!(usage.prompt_tokens, 20);
        assert_eq!(usage.completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_responses_stream_counts_tools() {
        let m = meta(ProviderType::OpenAi, "/v1/responses").with_stream(true);
        let completed = json!({
            "type": "response.completed",
            "response": {
                "output": [{"type": "web_search_call"}, {"type": "message"}],
                "usage": {"input_tokens": 5, "output_tokens": 7}
            }
        });
        let event = format!("event: response.completed\ndata: {}\n\n", completed);
        let response =
            RawResponse::chunked(200, Some("text/event-stream"), vec![Ok(Bytes::from(event))]);
        let usage = stream_response(&m, response, &mut BufferSink::new(), Some("medium"))
            .await
            .unwrap();
        assert_eq!(usage.total_tokens, 12);
        assert_eq!(usage.tool(BuiltInTool::WebSearch).unwrap().call_count, 1);
    }

    #[tokio::test]
    async fn test_search_preview_bills_one_search() {
        let channel = Channel::new(1, ProviderType::OpenAi, "c");
        let m = RelayMeta::for_channel(&channel, "r", "/v1/chat/completions", "gpt-4o-search-preview");
        let body = json!({"usage": {"prompt_tokens": 3, "completion_tokens": 4}}).to_string();
        let response = RawResponse::buffered(200, Some("application/json"), body);
        let usage = json_response(&m, response, &mut BufferSink::new(), Some("low"))
            .await
            .unwrap();
        let web = usage.tool(BuiltInTool::WebSearch).unwrap();
        assert_eq!(web.call_count, 1);
        assert_eq!(web.search_context_size.as_deref(), Some("low"));
    }
}
