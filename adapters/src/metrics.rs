//! Adapter metrics

use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};
use std::time::Duration;

lazy_static::lazy_static! {
    /// Upstream requests by provider and outcome
    pub static ref ADAPTOR_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "adaptor_requests_total",
        "Total upstream requests",
        &["provider", "outcome"]
    )
    .expect("adaptor_requests_total registers once");

    /// Time to upstream response headers
    pub static ref ADAPTOR_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "adaptor_request_duration_seconds",
        "Upstream time to response headers",
        &["provider"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .expect("adaptor_request_duration_seconds registers once");

    /// Stream chunks forwarded
    pub static ref ADAPTOR_STREAM_CHUNKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "adaptor_stream_chunks_total",
        "Chunks forwarded to streaming clients",
        &["provider"]
    )
    .expect("adaptor_stream_chunks_total registers once");
}

/// Record one upstream call
pub fn record_request(provider: &str, status: Option<u16>, elapsed: Duration) {
    let outcome = match status {
        Some(s) if (200..300).contains(&s) => "success",
        Some(s) if s >= 500 => "server_error",
        Some(_) => "client_error",
        None => "transport_error",
    };
    ADAPTOR_REQUESTS_TOTAL
        .with_label_values(&[provider, outcome])
        .inc();
    ADAPTOR_REQUEST_DURATION
        .with_label_values(&[provider])
        .observe(elapsed.as_secs_f64());
}
