//! Streaming relays: chunk forwarding, usage and the no-retry-after-commit rule

mod common;

use adapters::MockOutcome;
use bytes::Bytes;
use common::*;
use tokio_stream::StreamExt;

async fn collect(mut chunks: tokio_stream::wrappers::ReceiverStream<Bytes>) -> String {
    let mut out = Vec::new();
    while let Some(chunk) = chunks.next().await {
        out.extend_from_slice(&chunk);
    }
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn test_stream_forwards_chunks_and_bills_usage() {
    let env = TestEnvironment::new(custom_channels(1));
    env.mock
        .push(1, MockOutcome::stream(["Hel", "lo"], 10, 5));

    let (chunks, handle) = env.relay.stream(stream_request(), env.route("req-stream", 1));
    let body = collect(chunks).await;
    let summary = handle.await.unwrap().unwrap();
    env.drain().await;

    assert!(body.contains("Hel"));
    assert!(body.contains("lo"));
    assert!(body.trim_end().ends_with("data: [DONE]"));

    assert_eq!(summary.usage.prompt_tokens, 10);
    assert_eq!(summary.usage.completion_tokens, 5);
    assert_eq!(summary.charge, 15);
    assert_eq!(env.user_quota(), USER_QUOTA - 15);

    let consumes = env.usage_log.consumes();
    assert_eq!(consumes.len(), 1);
    assert!(consumes[0].is_stream);
}

#[tokio::test]
async fn test_stream_fails_over_before_first_byte() {
    let env = TestEnvironment::new(custom_channels(2));
    env.mock.push(1, MockOutcome::status(503, "overloaded"));
    env.mock.push(2, MockOutcome::stream(["ok"], 10, 1));

    let (chunks, handle) = env.relay.stream(stream_request(), env.route("req-stream-retry", 1));
    let body = collect(chunks).await;
    let summary = handle.await.unwrap().unwrap();

    assert_eq!(summary.attempts, vec![1, 2]);
    assert!(body.contains("ok"));
    assert!(!body.contains("overloaded"));
}

#[tokio::test]
async fn test_broken_stream_is_not_retried_after_commit() {
    let env = TestEnvironment::new(custom_channels(2));
    env.mock.push(
        1,
        MockOutcome::StreamThenFail {
            chunks: vec!["partial".to_string()],
        },
    );

    let (chunks, handle) = env.relay.stream(stream_request(), env.route("req-broken", 1));
    let body = collect(chunks).await;
    let err = handle.await.unwrap().unwrap_err();
    env.drain().await;

    assert_eq!(env.mock.attempted_channels(), vec![1]);
    assert!(body.contains("partial"));
    assert!(err.message.ends_with("(request id: req-broken)"));

    // nothing was settled, the reservation went back
    assert_eq!(env.user_quota(), USER_QUOTA);
    assert_eq!(env.ledger.open_reservations(), 0);
}

#[tokio::test]
async fn test_dropped_client_releases_reservation() {
    let env = TestEnvironment::new(custom_channels(1));
    env.mock.push(1, MockOutcome::stream(["a", "b", "c"], 10, 3));

    let (chunks, handle) = env.relay.stream(stream_request(), env.route("req-gone", 1));
    drop(chunks);
    let result = handle.await.unwrap();
    env.drain().await;

    assert!(result.is_err());
    assert_eq!(env.user_quota(), USER_QUOTA);
    assert_eq!(env.ledger.open_reservations(), 0);
}
