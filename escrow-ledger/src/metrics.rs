//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring escrow activity.
//!
//! # Metrics
//!
//! - `escrow_holds_total` - Escrow holds placed
//! - `escrow_releases_total` - Escrows released to sellers
//! - `escrow_refunds_total` - Escrows refunded to buyers (disputes and cancellations)
//! - `escrow_cancellations_total` - PENDING orders cancelled
//! - `escrow_disputes_opened_total` - Disputes opened
//! - `escrow_already_resolved_total` - Resolutions rejected as duplicates
//! - `escrow_integrity_alarms_total` - Integrity violations detected
//! - `escrow_notification_failures_total` - Notifications the emitter failed to deliver
//! - `escrow_resolve_duration_seconds` - Histogram of resolution latencies

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
///
/// Each collector owns its registry, so several ledgers (and tests) can run
/// in one process.
#[derive(Clone)]
pub struct Metrics {
    /// Escrow holds placed
    pub holds_total: IntCounter,

    /// Escrows released
    pub releases_total: IntCounter,

    /// Escrows refunded
    pub refunds_total: IntCounter,

    /// Orders cancelled
    pub cancellations_total: IntCounter,

    /// Disputes opened
    pub disputes_opened_total: IntCounter,

    /// Duplicate resolutions rejected
    pub already_resolved_total: IntCounter,

    /// Integrity violations detected
    pub integrity_alarms_total: IntCounter,

    /// Failed notification deliveries
    pub notification_failures_total: IntCounter,

    /// Resolution latency histogram
    pub resolve_duration: Histogram,

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

        let holds_total = counter("escrow_holds_total", "Escrow holds placed")?;
        let releases_total = counter("escrow_releases_total", "Escrows released to sellers")?;
        let refunds_total = counter("escrow_refunds_total", "Escrows refunded to buyers")?;
        let cancellations_total =
            counter("escrow_cancellations_total", "PENDING orders cancelled")?;
        let disputes_opened_total = counter("escrow_disputes_opened_total", "Disputes opened")?;
        let already_resolved_total = counter(
            "escrow_already_resolved_total",
            "Resolutions rejected because the escrow was already resolved",
        )?;
        let integrity_alarms_total = counter(
            "escrow_integrity_alarms_total",
            "Integrity violations detected",
        )?;
        let notification_failures_total = counter(
            "escrow_notification_failures_total",
            "Notifications the emitter failed to deliver",
        )?;

        let resolve_duration = Histogram::with_opts(
            HistogramOpts::new(
                "escrow_resolve_duration_seconds",
                "Histogram of resolution latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(resolve_duration.clone()))?;

        Ok(Self {
            holds_total,
            releases_total,
            refunds_total,
            cancellations_total,
            disputes_opened_total,
            already_resolved_total,
            integrity_alarms_total,
            notification_failures_total,
            resolve_duration,
            registry,
        })
    }

    /// Record resolution duration
    pub fn record_resolve_duration(&self, duration_seconds: f64) {
        self.resolve_duration.observe(duration_seconds);
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("holds_total", &self.holds_total.get())
            .field("releases_total", &self.releases_total.get())
            .field("refunds_total", &self.refunds_total.get())
            .field("integrity_alarms_total", &self.integrity_alarms_total.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.holds_total.get(), 0);
        assert_eq!(metrics.integrity_alarms_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.releases_total.inc();
        assert_eq!(first.releases_total.get(), 1);
        assert_eq!(second.releases_total.get(), 0);
    }

    #[test]
    fn test_render() {
        let metrics = Metrics::new().unwrap();
        metrics.disputes_opened_total.inc();
        metrics.record_resolve_duration(0.003);

        let text = metrics.render().unwrap();
        assert!(text.contains("escrow_disputes_opened_total 1"));
        assert!(text.contains("escrow_resolve_duration_seconds_count 1"));
    }
}
