// core/common/src/persistence/postgres.rs
// Postgres-backed store (runtime sqlx queries)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{Persistence, QuotaStore, StoreError};
use crate::models::{
    CollectionRecord, MonitorStateRecord, MonitorStatus, Quota, TenantId, TransactionRecord,
    TxStatus, CONFIRMED_DEPTH,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS monitored_addresses (
        id BIGSERIAL PRIMARY KEY,
        tenant_id BIGINT NOT NULL,
        coin VARCHAR(10) NOT NULL,
        address VARCHAR(100) NOT NULL,
        label TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        added_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (tenant_id, coin, address)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        tenant_id BIGINT NOT NULL,
        coin VARCHAR(10) NOT NULL,
        txid VARCHAR(64) NOT NULL,
        address VARCHAR(100) NOT NULL,
        amount_satoshis BIGINT NOT NULL,
        confirmations INTEGER NOT NULL DEFAULT 0,
        status VARCHAR(16) NOT NULL,
        observed_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (tenant_id, coin, txid, address)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS collections (
        txid VARCHAR(64) PRIMARY KEY,
        tenant_id BIGINT NOT NULL,
        coin VARCHAR(10) NOT NULL,
        address VARCHAR(100) NOT NULL,
        amount_sent_satoshis BIGINT NOT NULL,
        total_satoshis BIGINT NOT NULL,
        fee_satoshis BIGINT NOT NULL,
        master_address VARCHAR(100) NOT NULL,
        collected_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_monitors (
        tenant_id BIGINT NOT NULL,
        coin VARCHAR(10) NOT NULL,
        monitor_id VARCHAR(64) NOT NULL,
        status VARCHAR(16) NOT NULL,
        last_active TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (tenant_id, coin)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_quotas (
        tenant_id BIGINT PRIMARY KEY,
        max_monitored_addresses INTEGER NOT NULL,
        max_daily_api_calls INTEGER NOT NULL,
        max_concurrent_monitors INTEGER NOT NULL,
        can_collect_funds BOOLEAN NOT NULL,
        can_create_addresses BOOLEAN NOT NULL,
        can_view_transactions BOOLEAN NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_activities (
        id BIGSERIAL PRIMARY KEY,
        tenant_id BIGINT NOT NULL,
        action VARCHAR(64) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_address ON transactions (tenant_id, coin, address)",
    "CREATE INDEX IF NOT EXISTS idx_user_activities_day ON user_activities (tenant_id, created_at)",
];

#[derive(sqlx::FromRow)]
struct TransactionRow {
    tenant_id: i64,
    coin: String,
    txid: String,
    address: String,
    amount_satoshis: i64,
    confirmations: i32,
    status: String,
    observed_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            tenant_id: TenantId(row.tenant_id),
            coin: row.coin,
            txid: row.txid,
            address: row.address,
            amount_satoshis: non_negative(row.amount_satoshis, "amount_satoshis")?,
            confirmations: non_negative(row.confirmations.into(), "confirmations")? as u32,
            status: row.status.parse().map_err(StoreError::InvalidData)?,
            timestamp: row.observed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CollectionRow {
    txid: String,
    tenant_id: i64,
    coin: String,
    address: String,
    amount_sent_satoshis: i64,
    total_satoshis: i64,
    fee_satoshis: i64,
    master_address: String,
    collected_at: DateTime<Utc>,
}

impl TryFrom<CollectionRow> for CollectionRecord {
    type Error = StoreError;

    fn try_from(row: CollectionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            tenant_id: TenantId(row.tenant_id),
            coin: row.coin,
            address: row.address,
            txid: row.txid,
            amount_sent_satoshis: non_negative(row.amount_sent_satoshis, "amount_sent_satoshis")?,
            total_satoshis: non_negative(row.total_satoshis, "total_satoshis")?,
            fee_satoshis: non_negative(row.fee_satoshis, "fee_satoshis")?,
            master_address: row.master_address,
            timestamp: row.collected_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MonitorRow {
    tenant_id: i64,
    coin: String,
    monitor_id: String,
    status: String,
    last_active: DateTime<Utc>,
}

impl TryFrom<MonitorRow> for MonitorStateRecord {
    type Error = StoreError;

    fn try_from(row: MonitorRow) -> Result<Self, Self::Error> {
        let status = match row.status.as_str() {
            "running" => MonitorStatus::Running,
            "stopped" => MonitorStatus::Stopped,
            "failed" => MonitorStatus::Failed,
            other => {
                return Err(StoreError::InvalidData(format!(
                    "unknown monitor status: {}",
                    other
                )))
            }
        };
        Ok(Self {
            tenant_id: TenantId(row.tenant_id),
            coin: row.coin,
            monitor_id: row.monitor_id,
            status,
            last_active: row.last_active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QuotaRow {
    max_monitored_addresses: i32,
    max_daily_api_calls: i32,
    max_concurrent_monitors: i32,
    can_collect_funds: bool,
    can_create_addresses: bool,
    can_view_transactions: bool,
}

impl From<QuotaRow> for Quota {
    fn from(row: QuotaRow) -> Self {
        Self {
            max_monitored_addresses: row.max_monitored_addresses.max(0) as u32,
            max_daily_api_calls: row.max_daily_api_calls.max(0) as u32,
            max_concurrent_monitors: row.max_concurrent_monitors.max(0) as u32,
            can_collect_funds: row.can_collect_funds,
            can_create_addresses: row.can_create_addresses,
            can_view_transactions: row.can_view_transactions,
        }
    }
}

fn non_negative(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("negative {}: {}", column, value)))
}

fn to_db_amount(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidData(format!("amount overflow: {}", value)))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for PgStore {
    async fn get_active_addresses(
        &self,
        tenant_id: TenantId,
        coin: &str,
    ) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT address FROM monitored_addresses
            WHERE tenant_id = $1 AND coin = $2 AND is_active = TRUE
            ORDER BY address
            "#,
        )
        .bind(tenant_id.0)
        .bind(coin)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(address,)| address).collect())
    }

    async fn add_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
        label: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO monitored_addresses (tenant_id, coin, address, label, is_active)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (tenant_id, coin, address)
            DO UPDATE SET is_active = TRUE,
                          label = COALESCE(EXCLUDED.label, monitored_addresses.label)
            "#,
        )
        .bind(tenant_id.0)
        .bind(coin)
        .bind(address)
        .bind(label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE monitored_addresses SET is_active = FALSE
            WHERE tenant_id = $1 AND coin = $2 AND address = $3
            "#,
        )
        .bind(tenant_id.0)
        .bind(coin)
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_transaction(
        &self,
        record: &TransactionRecord,
    ) -> Result<TransactionRecord, StoreError> {
        let row: TransactionRow = sqlx::query_as(
            r#"
            INSERT INTO transactions
                (tenant_id, coin, txid, address, amount_satoshis, confirmations, status, observed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant_id, coin, txid, address) DO UPDATE SET
                amount_satoshis = EXCLUDED.amount_satoshis,
                confirmations = GREATEST(transactions.confirmations, EXCLUDED.confirmations),
                status = CASE
                    WHEN GREATEST(transactions.confirmations, EXCLUDED.confirmations) >= $9 THEN 'confirmed'
                    WHEN GREATEST(transactions.confirmations, EXCLUDED.confirmations) >= 1 THEN 'confirming'
                    ELSE EXCLUDED.status
                END,
                observed_at = EXCLUDED.observed_at,
                updated_at = NOW()
            RETURNING tenant_id, coin, txid, address, amount_satoshis, confirmations, status, observed_at
            "#,
        )
        .bind(record.tenant_id.0)
        .bind(&record.coin)
        .bind(&record.txid)
        .bind(&record.address)
        .bind(to_db_amount(record.amount_satoshis)?)
        .bind(record.confirmations.min(i32::MAX as u32) as i32)
        .bind(record.status.as_str())
        .bind(record.timestamp)
        .bind(CONFIRMED_DEPTH as i32)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn save_collection(&self, record: &CollectionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO collections
                (txid, tenant_id, coin, address, amount_sent_satoshis, total_satoshis,
                 fee_satoshis, master_address, collected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.txid)
        .bind(record.tenant_id.0)
        .bind(&record.coin)
        .bind(&record.address)
        .bind(to_db_amount(record.amount_sent_satoshis)?)
        .bind(to_db_amount(record.total_satoshis)?)
        .bind(to_db_amount(record.fee_satoshis)?)
        .bind(&record.master_address)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_monitor_state(&self, state: &MonitorStateRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_monitors (tenant_id, coin, monitor_id, status, last_active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, coin) DO UPDATE SET
                monitor_id = EXCLUDED.monitor_id,
                status = EXCLUDED.status,
                last_active = EXCLUDED.last_active
            "#,
        )
        .bind(state.tenant_id.0)
        .bind(&state.coin)
        .bind(&state.monitor_id)
        .bind(state.status.as_str())
        .bind(state.last_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_transactions_for_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, coin, txid, address, amount_satoshis, confirmations, status, observed_at
            FROM transactions
            WHERE tenant_id = $1 AND coin = $2 AND address = $3
            ORDER BY observed_at DESC
            LIMIT $4
            "#,
        )
        .bind(tenant_id.0)
        .bind(coin)
        .bind(address)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRecord::try_from).collect()
    }

    async fn get_collections_for_address(
        &self,
        tenant_id: TenantId,
        coin: &str,
        address: &str,
    ) -> Result<Vec<CollectionRecord>, StoreError> {
        let rows: Vec<CollectionRow> = sqlx::query_as(
            r#"
            SELECT txid, tenant_id, coin, address, amount_sent_satoshis, total_satoshis,
                   fee_satoshis, master_address, collected_at
            FROM collections
            WHERE tenant_id = $1 AND coin = $2 AND address = $3
            ORDER BY collected_at DESC
            "#,
        )
        .bind(tenant_id.0)
        .bind(coin)
        .bind(address)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CollectionRecord::try_from).collect()
    }

    async fn get_pending_transactions(
        &self,
        tenant_id: TenantId,
        coin: &str,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, coin, txid, address, amount_satoshis, confirmations, status, observed_at
            FROM transactions
            WHERE tenant_id = $1 AND coin = $2 AND status <> $3
            ORDER BY observed_at
            "#,
        )
        .bind(tenant_id.0)
        .bind(coin)
        .bind(TxStatus::Confirmed.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransactionRecord::try_from).collect()
    }

    async fn get_running_monitors(&self) -> Result<Vec<MonitorStateRecord>, StoreError> {
        let rows: Vec<MonitorRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, coin, monitor_id, status, last_active
            FROM user_monitors
            WHERE status = $1
            "#,
        )
        .bind(MonitorStatus::Running.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MonitorStateRecord::try_from).collect()
    }
}

#[async_trait]
impl QuotaStore for PgStore {
    async fn get_quota(&self, tenant_id: TenantId) -> Result<Option<Quota>, StoreError> {
        let row: Option<QuotaRow> = sqlx::query_as(
            r#"
            SELECT max_monitored_addresses, max_daily_api_calls, max_concurrent_monitors,
                   can_collect_funds, can_create_addresses, can_view_transactions
            FROM user_quotas WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Quota::from))
    }

    async fn set_quota(&self, tenant_id: TenantId, quota: &Quota) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_quotas
                (tenant_id, max_monitored_addresses, max_daily_api_calls, max_concurrent_monitors,
                 can_collect_funds, can_create_addresses, can_view_transactions)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id) DO UPDATE SET
                max_monitored_addresses = EXCLUDED.max_monitored_addresses,
                max_daily_api_calls = EXCLUDED.max_daily_api_calls,
                max_concurrent_monitors = EXCLUDED.max_concurrent_monitors,
                can_collect_funds = EXCLUDED.can_collect_funds,
                can_create_addresses = EXCLUDED.can_create_addresses,
                can_view_transactions = EXCLUDED.can_view_transactions
            "#,
        )
        .bind(tenant_id.0)
        .bind(quota.max_monitored_addresses.min(i32::MAX as u32) as i32)
        .bind(quota.max_daily_api_calls.min(i32::MAX as u32) as i32)
        .bind(quota.max_concurrent_monitors.min(i32::MAX as u32) as i32)
        .bind(quota.can_collect_funds)
        .bind(quota.can_create_addresses)
        .bind(quota.can_view_transactions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_active_addresses(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM monitored_addresses WHERE tenant_id = $1 AND is_active = TRUE",
        )
        .bind(tenant_id.0)
        .fetch_one(&self.pool)
        .await?;
        non_negative(count, "count")
    }

    async fn count_active_monitors(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_monitors WHERE tenant_id = $1 AND status = $2",
        )
        .bind(tenant_id.0)
        .bind(MonitorStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await?;
        non_negative(count, "count")
    }

    async fn count_api_calls_today(&self, tenant_id: TenantId) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_activities WHERE tenant_id = $1 AND created_at::date = CURRENT_DATE",
        )
        .bind(tenant_id.0)
        .fetch_one(&self.pool)
        .await?;
        non_negative(count, "count")
    }

    async fn log_api_call(&self, tenant_id: TenantId, action: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO user_activities (tenant_id, action) VALUES ($1, $2)")
            .bind(tenant_id.0)
            .bind(action)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
