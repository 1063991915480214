// core/common/src/persistence/memory.rs
// In-process store for tests and database-less runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Persistence, QuotaStore, StoreError};
use crate::models::{
    CollectionRecord, MonitorStateRecord, MonitoredAddress, Quota, TenantId, TransactionRecord,
    TxStatus,
};

type AddressKey = (TenantId, String, String);
type TxKey = (TenantId, String, String, String);

#[derive(Default)]
struct Tables {
    addresses: HashMap<AddressKey, MonitoredAddress>,
    transactions: HashMap<TxKey, TransactionRecord>,
    collections: Vec<CollectionRecord>,
    monitors: HashMap<(TenantId, String), MonitorStateRecord>,
    quotas: HashMap<TenantId, Quota>,
    activities: Vec<(TenantId, String, DateTime<Utc>)>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transaction_count(&self) -> usize {
        self.tables.read().await.transactions.len()
    }

    pub async fn collection_count(&self) -> usize {
        self.tables.read().await.collections.len()
    }

    pub async fn monitor_state(
        &self,
        tenant_id: TenantId,
        coin: &str,
    ) -> Option<MonitorStateRecord> {
        self.tables
            .read()
            .await
            .monitors
            .get(&(tenant_id, coin.to_uppercase()))
            .cloned()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn get_active_addresses(
        &self,
        tenant_id: TenantId,
        coin: &str,
    ) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().await;
        let mut addresses: Vec<String> = tables
            .addresses
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.coin == coin && a.is_active)
            .map(|a| a.address.clone())
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    async fn add_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
        label: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let key = (tenant_id, coin.to_string(), address.to_string());
        let entry = tables
            .addresses
            .entry(key)
            .or_insert_with(|| MonitoredAddress {
                tenant_id,
                coin: coin.to_string(),
                address: address.to_string(),
                label: None,
                is_active: true,
                added_at: Utc::now(),
            });
        entry.is_active = true;
        if let Some(label) = label {
            entry.label = Some(label.to_string());
        }
        Ok(())
    }

    async fn deactivate_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let key = (tenant_id, coin.to_string(), address.to_string());
        if let Some(entry) = tables.addresses.get_mut(&key) {
            entry.is_active = false;
        }
        Ok(())
    }

    async fn upsert_transaction(
        &self,
        record: &TransactionRecord,
    ) -> Result<TransactionRecord, StoreError> {
        let mut tables = self.tables.write().await;
        let key = (
            record.tenant_id,
            record.coin.clone(),
            record.txid.clone(),
            record.address.clone(),
        );

        let mut stored = record.clone();
        if let Some(existing) = tables.transactions.get(&key) {
            if existing.confirmations > stored.confirmations {
                stored.confirmations = existing.confirmations;
                stored.status = TxStatus::from_confirmations(stored.confirmations);
            }
        }
        tables.transactions.insert(key, stored.clone());
        Ok(stored)
    }

    async fn save_collection(&self, record: &CollectionRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.collections.iter().any(|c| c.txid == record.txid) {
            return Err(StoreError::Conflict(format!(
                "collection {} already recorded",
                record.txid
            )));
        }
        tables.collections.push(record.clone());
        Ok(())
    }

    async fn save_monitor_state(&self, state: &MonitorStateRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .monitors
            .insert((state.tenant_id, state.coin.to_uppercase()), state.clone());
        Ok(())
    }

    async fn get_transactions_for_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut records: Vec<TransactionRecord> = tables
            .transactions
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.coin == coin && t.address == address)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }

    async fn get_collections_for_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
    ) -> Result<Vec<CollectionRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .collections
            .iter()
            .filter(|c| c.tenant_id == tenant_id && c.coin == coin && c.address == address)
            .cloned()
            .collect())
    }

    async fn get_pending_transactions(
        &self,
        tenant_id: TenantId,
        coin: &str,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.coin == coin && !t.status.is_final())
            .cloned()
            .collect())
    }

    async fn get_running_monitors(&self) -> Result<Vec<MonitorStateRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .monitors
            .values()
            .filter(|m| m.status.is_active())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_quota(&self, tenant_id: TenantId) -> Result<Option<Quota>, StoreError> {
        Ok(self.tables.read().await.quotas.get(&tenant_id).cloned())
    }

    async fn set_quota(&self, tenant_id: TenantId, quota: &Quota) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .quotas
            .insert(tenant_id, quota.clone());
        Ok(())
    }

    async fn count_active_addresses(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .addresses
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.is_active)
            .count() as u64)
    }

    async fn count_active_monitors(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .monitors
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.status.is_active())
            .count() as u64)
    }

    async fn count_api_calls_today(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        let today = Utc::now().date_naive();
        let tables = self.tables.read().await;
        Ok(tables
            .activities
            .iter()
            .filter(|(tenant, _, at)| *tenant == tenant_id && at.date_naive() == today)
            .count() as u64)
    }

    async fn log_api_call(&self, tenant_id: TenantId, action: &str) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .activities
            .push((tenant_id, action.to_string(), Utc::now()));
        Ok(())
    }
}
