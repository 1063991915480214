// core/common/src/lib.rs
// Coinwatch Common Library - models, storage contract and ambient plumbing shared by all crates

pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod tenancy;
pub mod validation;

// Re-export commonly used items
pub use config::{CoinConfig, ModuleSettings, MonitorSettings};
pub use error::{ErrorResponse, ServiceError};
pub use health::{
    check_database_health, ComponentHealth, HealthReport, HealthStatus, LivenessProbe,
    ReadinessProbe,
};
pub use logging::{generate_request_id, init_console_logging, init_logging, sanitize_for_logging};
pub use metrics::{MetricsSink, MetricsTimer, NoopMetrics, PrometheusMetrics};
pub use models::{
    format_coins, monitor_id, short, CollectionRecord, MonitorStateRecord, MonitorStatus,
    MonitoredAddress, Quota, TenantId, TransactionRecord, TxStatus, SATOSHIS_PER_COIN,
};
pub use persistence::{MemoryStore, Persistence, PgStore, QuotaStore, StoreError};
pub use tenancy::{Capability, QuotaResource, TenancyError, TenancyGate};
pub use validation::{
    validate_address, validate_coin_symbol, validate_monitored_address,
    validate_private_key_shape, validate_txid, ValidationError,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        let _ = generate_request_id();
        let _ = NoopMetrics;
        let _ = CoinConfig::for_symbol("LTC");
        let _ = MemoryStore::new();
    }
}
