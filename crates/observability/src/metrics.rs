//! Prometheus metrics infrastructure
//!
//! This module provides utilities for initializing Prometheus metrics
//! and the metric set recorded by the settlement engine and notifier.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Initialize the Prometheus metrics exporter
///
/// This starts an HTTP server on the specified port that exposes metrics
/// at the `/metrics` endpoint.
///
/// # Example
///
/// ```ignore
/// observability::metrics::init_metrics(9090)?;
/// // Metrics available at http://localhost:9090/metrics
/// ```
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Metrics server listening");
    Ok(())
}

/// Settlement metrics
///
/// Recording is a no-op until a recorder is installed (see [`init_metrics`]),
/// so an engine built without an exporter pays almost nothing.
///
/// # Metrics
///
/// * `settlement_orders_submitted_total` - Orders accepted by `submit_order`
/// * `settlement_fills_applied_total{status}` - Fills committed, by reported status
/// * `settlement_fill_conflicts_total` - Fills rejected by a version guard
/// * `settlement_fill_failures_total{reason}` - Fills rejected for any other reason
/// * `settlement_publish_failures_total` - Trade intents that could not be published
/// * `settlement_fill_duration_seconds` - Fill application latency
/// * `settlement_active_subscriptions` - Open order-event subscriptions
#[derive(Clone)]
pub struct SettlementMetrics {
    orders_submitted: Counter,
    fill_conflicts: Counter,
    publish_failures: Counter,
    fill_duration: Histogram,
    active_subscriptions: Gauge,
    service_name: String,
}

impl SettlementMetrics {
    /// Create metrics labelled with the owning service
    pub fn new(service_name: &str) -> Self {
        let name = service_name.to_string();

        Self {
            orders_submitted: counter!("settlement_orders_submitted_total", "service" => name.clone()),
            fill_conflicts: counter!("settlement_fill_conflicts_total", "service" => name.clone()),
            publish_failures: counter!("settlement_publish_failures_total", "service" => name.clone()),
            fill_duration: histogram!("settlement_fill_duration_seconds", "service" => name.clone()),
            active_subscriptions: gauge!("settlement_active_subscriptions", "service" => name.clone()),
            service_name: name,
        }
    }

    pub fn order_submitted(&self) {
        self.orders_submitted.increment(1);
    }

    /// Record a committed fill
    pub fn fill_applied(&self, status: &str) {
        counter!(
            "settlement_fills_applied_total",
            "service" => self.service_name.clone(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn fill_conflict(&self) {
        self.fill_conflicts.increment(1);
    }

    /// Record a rejected fill
    ///
    /// `reason` should be a short, bounded label such as `validation` or
    /// `not_found`, never free text.
    pub fn fill_failed(&self, reason: &'static str) {
        counter!(
            "settlement_fill_failures_total",
            "service" => self.service_name.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.increment(1);
    }

    pub fn record_fill_duration(&self, duration: Duration) {
        self.fill_duration.record(duration.as_secs_f64());
    }

    pub fn subscription_opened(&self) {
        self.active_subscriptions.increment(1.0);
    }

    pub fn subscription_closed(&self) {
        self.active_subscriptions.decrement(1.0);
    }

    /// Start timing a fill; the duration is recorded when the guard drops
    pub fn fill_timer(&self) -> FillTimer<'_> {
        FillTimer::new(self)
    }

    /// Get the service name
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl std::fmt::Debug for SettlementMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementMetrics")
            .field("service_name", &self.service_name)
            .finish()
    }
}

/// Fill timing guard that records duration on drop
///
/// # Example
///
/// ```ignore
/// let metrics = SettlementMetrics::new("orderledger");
/// {
///     let _timer = metrics.fill_timer();
///     // ... apply fill ...
/// } // Duration recorded when the guard is dropped
/// ```
pub struct FillTimer<'a> {
    metrics: &'a SettlementMetrics,
    start: Instant,
}

impl<'a> FillTimer<'a> {
    pub fn new(metrics: &'a SettlementMetrics) -> Self {
        Self {
            metrics,
            start: Instant::now(),
        }
    }
}

impl Drop for FillTimer<'_> {
    fn drop(&mut self) {
        self.metrics.record_fill_duration(self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_metrics_without_recorder() {
        // No recorder installed: every call must be a harmless no-op
        let metrics = SettlementMetrics::new("test");
        assert_eq!(metrics.service_name(), "test");

        metrics.order_submitted();
        metrics.fill_applied("CLOSED");
        metrics.fill_failed("validation");
        metrics.subscription_opened();
        metrics.subscription_closed();
        {
            let _timer = metrics.fill_timer();
        }
    }
}
