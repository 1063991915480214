// core/blockchain-monitor/src/main.rs
// Blockchain Monitor Service - Port 8084

use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{info, warn};

use blockchain_monitor::{HealthChecker, MonitorRegistry, WebhookCallback, SERVICE_NAME};
use coinwatch_common::{
    init_console_logging, init_logging, HealthStatus, LivenessProbe, MemoryStore, MetricsSink,
    ModuleSettings, PgStore, PrometheusMetrics, ReadinessProbe, ServiceError, TenantId,
};
use coinwatch_node::NodeClient;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// APPLICATION STATE
// ============================================================================

struct AppState {
    registry: Arc<MonitorRegistry>,
    health: HealthChecker,
    prometheus: Registry,
}

// ============================================================================
// HEALTH & METRICS ENDPOINTS
// ============================================================================

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let report = state.health.report().await;
    if report.status == HealthStatus::Unhealthy {
        HttpResponse::ServiceUnavailable().json(report)
    } else {
        HttpResponse::Ok().json(report)
    }
}

async fn liveness_check() -> HttpResponse {
    HttpResponse::Ok().json(LivenessProbe::healthy())
}

async fn readiness_check(state: web::Data<AppState>) -> HttpResponse {
    let report = state.health.report().await;
    let probe = ReadinessProbe::from_report(&report);
    if probe.ready {
        HttpResponse::Ok().json(probe)
    } else {
        HttpResponse::ServiceUnavailable().json(probe)
    }
}

async fn metrics_handler(state: web::Data<AppState>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.prometheus.gather();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(e.to_string());
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

// ============================================================================
// MONITOR ENDPOINTS
// ============================================================================

async fn list_monitors(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.registry.all_stats().await)
}

async fn monitor_stats(
    state: web::Data<AppState>,
    path: web::Path<(i64, String)>,
) -> Result<HttpResponse, ServiceError> {
    let (tenant_id, coin) = path.into_inner();
    let stats = state.registry.stats(TenantId(tenant_id), &coin).await?;
    Ok(HttpResponse::Ok().json(stats))
}

// ============================================================================
// STARTUP
// ============================================================================

fn build_registry<S>(
    store: Arc<S>,
    settings: &ModuleSettings,
    metrics: Arc<dyn MetricsSink>,
) -> anyhow::Result<MonitorRegistry>
where
    S: coinwatch_common::Persistence + coinwatch_common::QuotaStore + 'static,
{
    let mut registry = MonitorRegistry::new(store, settings.clone()).with_metrics(metrics.clone());

    if let Some(url) = &settings.webhook_url {
        info!(url = %url, "Transaction webhook enabled");
        registry = registry.with_callback(Arc::new(WebhookCallback::with_timeout(
            url.clone(),
            WEBHOOK_TIMEOUT,
        )?));
    }

    if settings.api_key.is_empty() {
        warn!("NOWNODES_API_KEY not set, UTXO backfill disabled");
    } else {
        let mut coins: Vec<&String> = settings.coins.keys().collect();
        coins.sort();
        for symbol in coins {
            let Some(pool) = registry.pool(symbol) else {
                continue;
            };
            let node = NodeClient::new(&settings.coin(symbol), &settings.api_key, pool)
                .with_metrics(metrics.clone());
            registry = registry.with_node(Arc::new(node));
        }
    }

    Ok(registry)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = ModuleSettings::from_env();

    if std::env::var("LOG_FORMAT").map(|f| f == "pretty").unwrap_or(false) {
        init_console_logging(SERVICE_NAME);
    } else {
        init_logging(SERVICE_NAME);
    }
    info!("Starting Blockchain Monitor Service");

    let prometheus = Registry::new();
    let metrics: Arc<dyn MetricsSink> =
        Arc::new(PrometheusMetrics::new(&prometheus, "blockchain_module")?);

    let (registry, database) = match &settings.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.ensure_schema().await?;
            info!("Connected to database");
            let registry = build_registry(Arc::new(store.clone()), &settings, metrics.clone())?;
            (registry, Some(store))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store");
            let registry = build_registry(Arc::new(MemoryStore::new()), &settings, metrics.clone())?;
            (registry, None)
        }
    };
    let registry = Arc::new(registry);

    let restored = registry.restore_running().await?;
    info!(restored, coins = settings.coins.len(), "Monitors restored");

    let mut health = HealthChecker::new(registry.clone(), metrics.clone());
    if let Some(store) = database {
        health = health.with_database(store);
    }

    let state = web::Data::new(AppState {
        registry: registry.clone(),
        health,
        prometheus,
    });

    info!(bind_address = %settings.bind_address, "HTTP server starting");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .wrap(
                middleware::DefaultHeaders::new()
                    .add(("X-Frame-Options", "DENY"))
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("Content-Security-Policy", "default-src 'self'")),
            )
            .route("/health", web::get().to(health_check))
            .route("/liveness", web::get().to(liveness_check))
            .route("/readiness", web::get().to(readiness_check))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/monitors", web::get().to(list_monitors))
            .route("/monitors/{tenant_id}/{coin}", web::get().to(monitor_stats))
    })
    .bind(&settings.bind_address)?
    .run()
    .await?;

    registry.shutdown().await;
    info!("Blockchain Monitor Service stopped");
    Ok(())
}
