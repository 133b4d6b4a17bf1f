//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `quota_reservations_total` - Reservations opened
//! - `quota_trusted_skips_total` - Reservations that skipped the debit
//! - `quota_settlements_total` - Reservations settled
//! - `quota_refunds_total` - Reservations refunded
//! - `quota_zero_usage_total` - Settlements with no upstream tokens
//! - `quota_charged_total` - Quota charged by settlements
//! - `quota_open_reservations` - Reservations not yet closed

use prometheus::{IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Reservations opened
    pub reservations_total: IntCounter,

    /// Trusted skips
    pub trusted_skips_total: IntCounter,

    /// Settlements
    pub settlements_total: IntCounter,

    /// Refunds
    pub refunds_total: IntCounter,

    /// Zero-token settlements
    pub zero_usage_total: IntCounter,

    /// Charged quota
    pub charged_total: IntCounter,

    /// Open reservations
    pub open_reservations: IntGauge,

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

        let reservations_total = counter("quota_reservations_total", "Reservations opened")?;
        let trusted_skips_total = counter(
            "quota_trusted_skips_total",
            "Reservations that skipped the debit",
        )?;
        let settlements_total = counter("quota_settlements_total", "Reservations settled")?;
        let refunds_total = counter("quota_refunds_total", "Reservations refunded")?;
        let zero_usage_total = counter(
            "quota_zero_usage_total",
            "Settlements with no upstream tokens",
        )?;
        let charged_total = counter("quota_charged_total", "Quota charged by settlements")?;

        let open_reservations =
            IntGauge::new("quota_open_reservations", "Reservations not yet closed")?;
        registry.register(Box::new(open_reservations.clone()))?;

        Ok(Self {
            reservations_total,
            trusted_skips_total,
            settlements_total,
            refunds_total,
            zero_usage_total,
            charged_total,
            open_reservations,
            registry,
        })
    }

    /// Record a new reservation
    pub fn record_reservation(&self, trusted: bool) {
        self.reservations_total.inc();
        self.open_reservations.inc();
        if trusted {
            self.trusted_skips_total.inc();
        }
    }

    /// Record a settlement
    pub fn record_settlement(&self, charge: i64, zero_usage: bool) {
        self.settlements_total.inc();
        self.open_reservations.dec();
        if charge > 0 {
            self.charged_total.inc_by(charge as u64);
        }
        if zero_usage {
            self.zero_usage_total.inc();
        }
    }

    /// Record a refund
    pub fn record_refund(&self) {
        self.refunds_total.inc();
        self.open_reservations.dec();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.reservations_total.get(), 0);
        // independent registries
        let _second = Metrics::new().unwrap();
    }

    #[test]
    fn test_reservation_lifecycle() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reservation(true);
        metrics.record_reservation(false);
        assert_eq!(metrics.open_reservations.get(), 2);
        assert_eq!(metrics.trusted_skips_total.get(), 1);

        metrics.record_settlement(7, false);
        metrics.record_refund();
        assert_eq!(metrics.open_reservations.get(), 0);
        assert_eq!(metrics.charged_total.get(), 7);
    }

    #[test]
    fn test_zero_usage_counted() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reservation(false);
        metrics.record_settlement(0, true);
        assert_eq!(metrics.zero_usage_total.get(), 1);
        assert_eq!(metrics.charged_total.get(), 0);
    }
}
