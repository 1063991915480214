// core/common/src/metrics.rs
// Metrics sink used by monitors, pools and collectors, with a Prometheus backend

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::time::Instant;

/// Named events and gauges reported by the core. Every method defaults to a
/// no-op so a sink only implements what it exports.
pub trait MetricsSink: Send + Sync {
    fn websocket_connected(&self, _coin: &str) {}
    fn websocket_disconnected(&self, _coin: &str) {}
    fn websocket_reconnect(&self, _coin: &str, _reason: &str) {}
    fn websocket_message(&self, _coin: &str, _message_type: &str) {}
    fn transaction_processed(&self, _coin: &str, _status: &str) {}
    fn monitored_addresses(&self, _coin: &str, _tenant: &str, _count: usize) {}
    fn funds_collection(&self, _coin: &str, _status: &str, _amount_satoshis: u64) {}
    fn health_status(&self, _coin: &str, _component: &str, _check: &str, _healthy: bool) {}
    fn api_request(&self, _coin: &str, _endpoint: &str, _success: bool, _duration_secs: f64) {}
    fn api_error(&self, _coin: &str, _endpoint: &str, _error_type: &str) {}
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Prometheus-backed sink. All series carry a `coin` label.
#[derive(Clone)]
pub struct PrometheusMetrics {
    pub api_requests_total: IntCounterVec,
    pub api_request_duration_seconds: HistogramVec,
    pub api_errors_total: IntCounterVec,
    pub transactions_processed_total: IntCounterVec,
    pub websocket_connections: IntGaugeVec,
    pub websocket_reconnects_total: IntCounterVec,
    pub websocket_messages_total: IntCounterVec,
    pub funds_collections_total: IntCounterVec,
    pub collected_satoshis_total: IntCounterVec,
    pub monitored_addresses: IntGaugeVec,
    pub health_status: IntGaugeVec,
    pub up: IntGauge,
}

impl PrometheusMetrics {
    pub fn new(registry: &Registry, namespace: &str) -> Result<Self, prometheus::Error> {
        let api_requests_total = IntCounterVec::new(
            Opts::new("api_requests_total", "Total number of node API requests")
                .namespace(namespace),
            &["coin", "endpoint", "status"],
        )?;
        registry.register(Box::new(api_requests_total.clone()))?;

        let api_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "api_request_duration_seconds",
                "Node API request duration in seconds",
            )
            .namespace(namespace)
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["coin", "endpoint"],
        )?;
        registry.register(Box::new(api_request_duration_seconds.clone()))?;

        let api_errors_total = IntCounterVec::new(
            Opts::new("api_errors_total", "Total number of node API errors")
                .namespace(namespace),
            &["coin", "endpoint", "error_type"],
        )?;
        registry.register(Box::new(api_errors_total.clone()))?;

        let transactions_processed_total = IntCounterVec::new(
            Opts::new(
                "transactions_processed_total",
                "Total number of processed transactions",
            )
            .namespace(namespace),
            &["coin", "status"],
        )?;
        registry.register(Box::new(transactions_processed_total.clone()))?;

        let websocket_connections = IntGaugeVec::new(
            Opts::new("websocket_connections", "Number of connected monitors")
                .namespace(namespace),
            &["coin"],
        )?;
        registry.register(Box::new(websocket_connections.clone()))?;

        let websocket_reconnects_total = IntCounterVec::new(
            Opts::new("websocket_reconnects_total", "Total number of monitor reconnects")
                .namespace(namespace),
            &["coin", "reason"],
        )?;
        registry.register(Box::new(websocket_reconnects_total.clone()))?;

        let websocket_messages_total = IntCounterVec::new(
            Opts::new("websocket_messages_total", "Total number of inbound messages")
                .namespace(namespace),
            &["coin", "type"],
        )?;
        registry.register(Box::new(websocket_messages_total.clone()))?;

        let funds_collections_total = IntCounterVec::new(
            Opts::new("funds_collections_total", "Total number of funds collections")
                .namespace(namespace),
            &["coin", "status"],
        )?;
        registry.register(Box::new(funds_collections_total.clone()))?;

        let collected_satoshis_total = IntCounterVec::new(
            Opts::new("collected_satoshis_total", "Total amount collected in satoshis")
                .namespace(namespace),
            &["coin"],
        )?;
        registry.register(Box::new(collected_satoshis_total.clone()))?;

        let monitored_addresses = IntGaugeVec::new(
            Opts::new("monitored_addresses", "Number of monitored addresses")
                .namespace(namespace),
            &["coin", "tenant"],
        )?;
        registry.register(Box::new(monitored_addresses.clone()))?;

        let health_status = IntGaugeVec::new(
            Opts::new("health_status", "Health status (1=healthy, 0=unhealthy)")
                .namespace(namespace),
            &["coin", "component", "check"],
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let up = IntGauge::with_opts(
            Opts::new("status", "Module status (1=running, 0=stopped)").namespace(namespace),
        )?;
        registry.register(Box::new(up.clone()))?;
        up.set(1);

        Ok(Self {
            api_requests_total,
            api_request_duration_seconds,
            api_errors_total,
            transactions_processed_total,
            websocket_connections,
            websocket_reconnects_total,
            websocket_messages_total,
            funds_collections_total,
            collected_satoshis_total,
            monitored_addresses,
            health_status,
            up,
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn websocket_connected(&self, coin: &str) {
        self.websocket_connections.with_label_values(&[coin]).inc();
    }

    fn websocket_disconnected(&self, coin: &str) {
        let gauge = self.websocket_connections.with_label_values(&[coin]);
        if gauge.get() > 0 {
            gauge.dec();
        }
    }

    fn websocket_reconnect(&self, coin: &str, reason: &str) {
        self.websocket_reconnects_total
            .with_label_values(&[coin, reason])
            .inc();
    }

    fn websocket_message(&self, coin: &str, message_type: &str) {
        self.websocket_messages_total
            .with_label_values(&[coin, message_type])
            .inc();
    }

    fn transaction_processed(&self, coin: &str, status: &str) {
        self.transactions_processed_total
            .with_label_values(&[coin, status])
            .inc();
    }

    fn monitored_addresses(&self, coin: &str, tenant: &str, count: usize) {
        self.monitored_addresses
            .with_label_values(&[coin, tenant])
            .set(count as i64);
    }

    fn funds_collection(&self, coin: &str, status: &str, amount_satoshis: u64) {
        self.funds_collections_total
            .with_label_values(&[coin, status])
            .inc();

        if status == "success" {
            self.collected_satoshis_total
                .with_label_values(&[coin])
                .inc_by(amount_satoshis);
        }
    }

    fn health_status(&self, coin: &str, component: &str, check: &str, healthy: bool) {
        self.health_status
            .with_label_values(&[coin, component, check])
            .set(if healthy { 1 } else { 0 });
    }

    fn api_request(&self, coin: &str, endpoint: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "error" };
        self.api_requests_total
            .with_label_values(&[coin, endpoint, status])
            .inc();
        self.api_request_duration_seconds
            .with_label_values(&[coin, endpoint])
            .observe(duration_secs);
    }

    fn api_error(&self, coin: &str, endpoint: &str, error_type: &str) {
        self.api_errors_total
            .with_label_values(&[coin, endpoint, error_type])
            .inc();
    }
}

/// Timer to measure operation duration
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for MetricsTimer {
    fn default() -> Self {
        Self::new()
    }
}
