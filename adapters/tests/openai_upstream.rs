//! OpenAI-compatible adaptor against a mock HTTP upstream
//!
//! Covers:
//! - Buffered JSON responses with usage
//! - Streamed responses with a trailing usage chunk
//! - Non-2xx statuses turned into structured errors
//! - Provider-specific auth headers and URLs

use adapters::{
    Adaptor, AdaptorRegistry, BufferSink, Config, Error, RelayMeta, ResponseSink,
};
use bytes::Bytes;
use channel_index::{Channel, ProviderType};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn channel(provider: ProviderType, server: &MockServer) -> Channel {
    Channel::new(7, provider, "upstream")
        .with_base_url(server.uri())
        .with_api_key("sk-upstream")
}

fn adaptor(provider: ProviderType) -> Box<dyn Adaptor> {
    AdaptorRegistry::with_defaults(&Config::default())
        .expect("registry")
        .resolve(provider)
        .expect("adaptor")
}

async fn run(
    adaptor: &mut Box<dyn Adaptor>,
    meta: &RelayMeta,
    body: serde_json::Value,
    sink: &mut dyn ResponseSink,
) -> adapters::Result<quota_ledger::Usage> {
    adaptor.init(meta);
    let payload = adaptor.convert_request(meta, &Bytes::from(body.to_string()))?;
    let response = adaptor.send_request(meta, payload).await?;
    if !response.is_success() {
        return Err(response.into_upstream_error().await);
    }
    adaptor.convert_response(meta, response, sink).await
}

#[tokio::test]
async fn json_response_reports_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-upstream"))
        .and(body_partial_json(json!({"model": "gpt-4o"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let meta = RelayMeta::for_channel(
        &channel(ProviderType::OpenAi, &server),
        "req-json",
        "/v1/chat/completions",
        "gpt-4o",
    );
    let mut sink = BufferSink::new();
    let mut adaptor = adaptor(ProviderType::OpenAi);
    let usage = run(
        &mut adaptor,
        &meta,
        json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
        &mut sink,
    )
    .await
    .expect("relay should succeed");

    assert_eq!(usage.prompt_tokens, 12);
    assert_eq!(usage.completion_tokens, 3);
    let (content_type, body) = sink.into_parts();
    assert!(content_type.unwrap().starts_with("application/json"));
    assert!(String::from_utf8_lossy(&body).contains("chatcmpl-1"));
}

#[tokio::test]
async fn stream_response_takes_trailing_usage() {
    let server = MockServer::start().await;
    let events = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":8,\"completion_tokens\":1,\"total_tokens\":9}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream_options": {"include_usage": true}})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(events, "text/event-stream"))
        .mount(&server)
        .await;

    let meta = RelayMeta::for_channel(
        &channel(ProviderType::OpenAi, &server),
        "req-stream",
        "/v1/chat/completions",
        "gpt-4o",
    )
    .with_stream(true);
    let mut sink = BufferSink::new();
    let mut adaptor = adaptor(ProviderType::OpenAi);
    let usage = run(
        &mut adaptor,
        &meta,
        json!({"model": "gpt-4o", "stream": true, "messages": []}),
        &mut sink,
    )
    .await
    .expect("stream should succeed");

    assert_eq!(usage.total_tokens, 9);
    let (content_type, body) = sink.into_parts();
    assert_eq!(content_type.as_deref(), Some("text/event-stream"));
    assert_eq!(&body[..], events.as_bytes());
}

#[tokio::test]
async fn error_status_becomes_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {"message": "Rate limit reached", "type": "rate_limit_error", "code": "rate_limit"}
        })))
        .mount(&server)
        .await;

    let meta = RelayMeta::for_channel(
        &channel(ProviderType::DeepSeek, &server),
        "req-429",
        "/v1/chat/completions",
        "deepseek-chat",
    );
    let mut sink = BufferSink::new();
    let mut adaptor = adaptor(ProviderType::DeepSeek);
    let err = run(&mut adaptor, &meta, json!({"messages": []}), &mut sink)
        .await
        .unwrap_err();

    match err {
        Error::Upstream {
            status_code,
            message,
            error_type,
            ..
        } => {
            assert_eq!(status_code, 429);
            assert_eq!(message, "Rate limit reached");
            assert_eq!(error_type, "rate_limit_error");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(sink.is_empty());
}

#[tokio::test]
async fn azure_uses_deployment_url_and_api_key_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/gpt-4o/chat/completions"))
        .and(query_param("api-version", "2024-02-01"))
        .and(header("api-key", "sk-upstream"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut channel = channel(ProviderType::Azure, &server);
    channel.api_version = Some("2024-02-01".to_string());
    let meta = RelayMeta::for_channel(&channel, "req-azure", "/v1/chat/completions", "gpt-4o");
    let mut adaptor = adaptor(ProviderType::Azure);
    let usage = run(&mut adaptor, &meta, json!({"messages": []}), &mut BufferSink::new())
        .await
        .expect("azure request should succeed");
    assert_eq!(usage.total_tokens, 2);
}

#[tokio::test]
async fn refused_connection_is_transport_error() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let channel = Channel::new(9, ProviderType::Custom, "gone").with_base_url(uri);
    let meta = RelayMeta::for_channel(&channel, "req-gone", "/v1/chat/completions", "m");
    let mut adaptor = adaptor(ProviderType::Custom);
    let err = run(&mut adaptor, &meta, json!({"messages": []}), &mut BufferSink::new())
        .await
        .unwrap_err();
    assert!(!err.is_local());
    assert_eq!(err.status_code(), 500);
}

#[tokio::test]
async fn stalled_body_reports_configured_timeout() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // headers and half a body, then silence
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 512\r\n\r\n{\"id\":",
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    });

    let config = Config {
        request_timeout_secs: 1,
        ..Config::default()
    };
    let mut adaptor = AdaptorRegistry::with_defaults(&config)
        .expect("registry")
        .resolve(ProviderType::Custom)
        .expect("adaptor");
    let channel = Channel::new(10, ProviderType::Custom, "stalled")
        .with_base_url(format!("http://{}", addr));
    let meta = RelayMeta::for_channel(&channel, "req-stalled", "/v1/chat/completions", "m");

    let err = run(&mut adaptor, &meta, json!({"messages": []}), &mut BufferSink::new())
        .await
        .unwrap_err();
    upstream.abort();

    assert!(matches!(err, Error::Timeout { seconds: 1, .. }), "{:?}", err);
    assert_eq!(err.status_code(), 504);
    assert_eq!(err.to_string(), "Timeout after 1s: reading upstream body");
}
