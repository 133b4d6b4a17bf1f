//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `relay_requests_total` - Requests entering the relay
//! - `relay_requests_failed_total` - Requests that ended in an error
//! - `relay_attempts_total` - Channel attempts
//! - `relay_retries_total` - Attempts after the first
//! - `relay_auto_bans_total` - Channels disabled by the auto-ban policy
//! - `relay_task_overflow_total` - Background jobs run outside the pool
//! - `relay_request_duration_seconds` - Wall time per request

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Requests
    pub requests_total: IntCounter,

    /// Failed requests
    pub requests_failed_total: IntCounter,

    /// Attempts
    pub attempts_total: IntCounter,

    /// Retries
    pub retries_total: IntCounter,

    /// Auto-bans
    pub auto_bans_total: IntCounter,

    /// Pool overflows
    pub task_overflow_total: IntCounter,

    /// Request latency
    pub request_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let requests_total = counter("relay_requests_total", "Requests entering the relay")?;
        let requests_failed_total = counter(
            "relay_requests_failed_total",
            "Requests that ended in an error",
        )?;
        let attempts_total = counter("relay_attempts_total", "Channel attempts")?;
        let retries_total = counter("relay_retries_total", "Attempts after the first")?;
        let auto_bans_total = counter(
            "relay_auto_bans_total",
            "Channels disabled by the auto-ban policy",
        )?;
        let task_overflow_total = counter(
            "relay_task_overflow_total",
            "Background jobs run outside the pool",
        )?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new("relay_request_duration_seconds", "Wall time per request")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            requests_total,
            requests_failed_total,
            attempts_total,
            retries_total,
            auto_bans_total,
            task_overflow_total,
            request_duration,
            registry,
        })
    }
}
