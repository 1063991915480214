// core/common/src/persistence/mod.rs
// Storage contract used by monitors, collectors and the tenancy gate

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    CollectionRecord, MonitorStateRecord, Quota, TenantId, TransactionRecord,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Address, transaction, collection and monitor-state storage.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_active_addresses(
        &self,
        tenant_id: TenantId,
        coin: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Inserts the address, or reactivates an existing row for it.
    async fn add_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
        label: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Soft delete; rows are never removed.
    async fn deactivate_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
    ) -> Result<(), StoreError>;

    /// Insert-or-update keyed by (tenant, coin, txid, address). Stored
    /// confirmations never decrease; the returned record is what was stored.
    async fn upsert_transaction(
        &self,
        record: &TransactionRecord,
    ) -> Result<TransactionRecord, StoreError>;

    /// Fails with `StoreError::Conflict` when the txid is already recorded.
    async fn save_collection(&self, record: &CollectionRecord) -> Result<(), StoreError>;

    async fn save_monitor_state(&self, state: &MonitorStateRecord) -> Result<(), StoreError>;

    async fn get_transactions_for_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn get_collections_for_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
    ) -> Result<Vec<CollectionRecord>, StoreError>;

    /// Transactions not yet at confirmed depth.
    async fn get_pending_transactions(
        &self,
        tenant_id: TenantId,
        coin: &str,
    ) -> Result<Vec<TransactionRecord>, StoreError>;

    /// Monitors last recorded as running, across all tenants.
    async fn get_running_monitors(&self) -> Result<Vec<MonitorStateRecord>, StoreError>;
}

/// Quota rows and the counters the tenancy gate compares against them.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_quota(&self, tenant_id: TenantId) -> Result<Option<Quota>, StoreError>;

    async fn set_quota(&self, tenant_id: TenantId, quota: &Quota) -> Result<(), StoreError>;

    async fn count_active_addresses(&self, tenant_id: TenantId) -> Result<u64, StoreError>;

    async fn count_active_monitors(&self, tenant_id: TenantId) -> Result<u64, StoreError>;

    async fn count_api_calls_today(&self, tenant_id: TenantId) -> Result<u64, StoreError>;

    async fn log_api_call(&self, tenant_id: TenantId, action: &str) -> Result<(), StoreError>;
}
