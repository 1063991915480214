// core/common/src/health.rs
// Health report types shared by monitor, pool and collector checks

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            coin: None,
            latency_ms: None,
            message: None,
            details: None,
        }
    }

    pub fn with_coin(mut self, coin: &str) -> Self {
        self.coin = Some(coin.to_string());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn new(service: &str, version: &str, start_time: SystemTime) -> Self {
        let uptime = SystemTime::now()
            .duration_since(start_time)
            .unwrap_or(Duration::from_secs(0))
            .as_secs();

        Self {
            status: HealthStatus::Healthy,
            service: service.to_string(),
            version: version.to_string(),
            uptime_seconds: uptime,
            components: Vec::new(),
        }
    }

    pub fn add_component(&mut self, component: ComponentHealth) {
        self.components.push(component);
        self.update_overall_status();
    }

    // Worst component status wins
    fn update_overall_status(&mut self) {
        self.status = self
            .components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
    }
}

/// Check database health
pub async fn check_database_health(pool: &PgPool) -> ComponentHealth {
    let start = SystemTime::now();

    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => {
            let latency = SystemTime::now()
                .duration_since(start)
                .unwrap_or(Duration::from_secs(0))
                .as_millis() as u64;

            let status = if latency > 1000 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };

            ComponentHealth::new("database", status).with_latency(latency)
        }
        Err(e) => ComponentHealth::new("database", HealthStatus::Unhealthy)
            .with_message(format!("Database error: {}", e)),
    }
}

/// Liveness probe - is the service running?
#[derive(Debug, Clone, Serialize)]
pub struct LivenessProbe {
    pub alive: bool,
}

impl LivenessProbe {
    pub fn healthy() -> Self {
        Self { alive: true }
    }
}

/// Readiness probe - are the monitors able to serve?
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessProbe {
    pub ready: bool,
    pub dependencies_ready: bool,
}

impl ReadinessProbe {
    pub fn new(dependencies_ready: bool) -> Self {
        Self {
            ready: dependencies_ready,
            dependencies_ready,
        }
    }

    pub fn from_report(report: &HealthReport) -> Self {
        Self::new(report.status != HealthStatus::Unhealthy)
    }
}
