// core/blockchain-monitor/src/health.rs
// Component checks behind the /health and /readiness endpoints

use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use coinwatch_common::{
    check_database_health, ComponentHealth, HealthReport, HealthStatus, MetricsSink, PgStore,
};
use coinwatch_node::ConnectionPool;

use crate::monitor::MonitorStats;
use crate::registry::MonitorRegistry;

pub const SERVICE_NAME: &str = "blockchain-monitor";
/// Reconnect attempts at which a connected monitor is reported degraded.
pub const DEGRADED_RECONNECT_ATTEMPTS: u32 = 5;
const IDLE_SECONDS: i64 = 60;

/// Unhealthy when disconnected; degraded when flapping or silent for a minute.
pub fn check_monitor(stats: &MonitorStats, now: DateTime<Utc>) -> ComponentHealth {
    let idle = stats
        .last_activity
        .map(|last| now - last > Duration::seconds(IDLE_SECONDS))
        .unwrap_or(true);

    let (status, message) = if !stats.connected {
        (HealthStatus::Unhealthy, "WebSocket not connected")
    } else if stats.reconnect_attempts >= DEGRADED_RECONNECT_ATTEMPTS {
        (HealthStatus::Degraded, "Frequent reconnections")
    } else if idle {
        (HealthStatus::Degraded, "No recent activity")
    } else {
        (HealthStatus::Healthy, "Monitor operational")
    };

    ComponentHealth::new(format!("monitor:{}:{}", stats.tenant_id, stats.coin), status)
        .with_coin(&stats.coin)
        .with_message(message)
        .with_details(json!({
            "state": stats.state,
            "monitored_addresses": stats.monitored_addresses,
            "reconnect_attempts": stats.reconnect_attempts,
            "errors": stats.errors,
            "last_activity": stats.last_activity,
        }))
}

/// A pool that has not opened anything yet counts as healthy.
pub async fn check_pool(coin: &str, pool: &ConnectionPool) -> ComponentHealth {
    let stats = pool.stats().await;
    let idle = !stats.http_session_active && stats.failed_connections == 0;

    let (status, message) = if pool.is_healthy().await {
        (HealthStatus::Healthy, "Pool operational")
    } else if idle {
        (HealthStatus::Healthy, "Pool idle")
    } else {
        (HealthStatus::Unhealthy, "Too many failed connections")
    };

    ComponentHealth::new(format!("pool:{}", coin), status)
        .with_coin(coin)
        .with_message(message)
        .with_details(json!({
            "open_websockets": stats.open_websockets,
            "successful_connections": stats.successful_connections,
            "failed_connections": stats.failed_connections,
        }))
}

/// Gathers every component into one report and mirrors it to the health gauge.
pub struct HealthChecker {
    registry: Arc<MonitorRegistry>,
    database: Option<PgStore>,
    metrics: Arc<dyn MetricsSink>,
    start_time: SystemTime,
}

impl HealthChecker {
    pub fn new(registry: Arc<MonitorRegistry>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            registry,
            database: None,
            metrics,
            start_time: SystemTime::now(),
        }
    }

    pub fn with_database(mut self, store: PgStore) -> Self {
        self.database = Some(store);
        self
    }

    pub async fn report(&self) -> HealthReport {
        let mut report = HealthReport::new(SERVICE_NAME, env!("CARGO_PKG_VERSION"), self.start_time);
        let now = Utc::now();

        if let Some(store) = &self.database {
            report.add_component(check_database_health(store.pool()).await);
        }

        for (coin, pool) in self.registry.pools() {
            let component = check_pool(&coin, &pool).await;
            self.metrics
                .health_status(&coin, "pool", "connections", component.status.is_healthy());
            report.add_component(component);
        }

        for stats in self.registry.all_stats().await {
            let component = check_monitor(&stats, now);
            self.metrics.health_status(
                &stats.coin,
                "monitor",
                "connection",
                component.status.is_healthy(),
            );
            report.add_component(component);
        }

        report
    }
}
