// core/common/src/models.rs
// Domain records shared by monitors, collectors and the stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SATOSHIS_PER_COIN: u64 = 100_000_000;

/// Confirmation depth at which a transaction is treated as final.
pub const CONFIRMED_DEPTH: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TenantId {
    fn from(id: i64) -> Self {
        TenantId(id)
    }
}

/// Confirmation-depth classification of an observed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Mempool,
    Confirming,
    Confirmed,
}

impl TxStatus {
    /// 0 -> mempool, 1..=2 -> confirming, 3+ -> confirmed.
    pub fn from_confirmations(confirmations: u32) -> Self {
        match confirmations {
            0 => TxStatus::Mempool,
            c if c >= CONFIRMED_DEPTH => TxStatus::Confirmed,
            _ => TxStatus::Confirming,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Mempool => "mempool",
            TxStatus::Confirming => "confirming",
            TxStatus::Confirmed => "confirmed",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TxStatus::Confirmed)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TxStatus::Pending),
            "mempool" => Ok(TxStatus::Mempool),
            "confirming" => Ok(TxStatus::Confirming),
            "confirmed" => Ok(TxStatus::Confirmed),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// Exact 8-decimal rendering, e.g. `109990000` -> `"1.09990000"`.
pub fn format_coins(satoshis: u64) -> String {
    format!(
        "{}.{:08}",
        satoshis / SATOSHIS_PER_COIN,
        satoshis % SATOSHIS_PER_COIN
    )
}

/// Rounds a coin-denominated amount to whole satoshis.
pub fn coins_to_satoshis(coins: f64) -> Option<u64> {
    if !coins.is_finite() || coins < 0.0 {
        return None;
    }
    Some((coins * SATOSHIS_PER_COIN as f64).round() as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredAddress {
    pub tenant_id: TenantId,
    pub coin: String,
    pub address: String,
    pub label: Option<String>,
    pub is_active: bool,
    pub added_at: DateTime<Utc>,
}

/// One row per (tenant, coin, txid, address).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tenant_id: TenantId,
    pub coin: String,
    pub txid: String,
    pub address: String,
    pub amount_satoshis: u64,
    pub confirmations: u32,
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
}

impl TransactionRecord {
    /// Builds a record whose status is derived from the confirmation count.
    pub fn observed(
        tenant_id: TenantId,
        coin: &str,
        txid: &str,
        address: &str,
        amount_satoshis: u64,
        confirmations: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            coin: coin.to_string(),
            txid: txid.to_string(),
            address: address.to_string(),
            amount_satoshis,
            confirmations,
            status: TxStatus::from_confirmations(confirmations),
            timestamp,
        }
    }

    pub fn key(&self) -> (TenantId, &str, &str, &str) {
        (self.tenant_id, &self.coin, &self.txid, &self.address)
    }
}

/// Written once per successful sweep; txid is globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub tenant_id: TenantId,
    pub coin: String,
    pub address: String,
    pub txid: String,
    pub amount_sent_satoshis: u64,
    pub total_satoshis: u64,
    pub fee_satoshis: u64,
    pub master_address: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub max_monitored_addresses: u32,
    pub max_daily_api_calls: u32,
    pub max_concurrent_monitors: u32,
    pub can_collect_funds: bool,
    pub can_create_addresses: bool,
    pub can_view_transactions: bool,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_monitored_addresses: 100,
            max_daily_api_calls: 10_000,
            max_concurrent_monitors: 5,
            can_collect_funds: false,
            can_create_addresses: true,
            can_view_transactions: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Running,
    Stopped,
    Failed,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Running => "running",
            MonitorStatus::Stopped => "stopped",
            MonitorStatus::Failed => "failed",
        }
    }

    /// Only running monitors count against the concurrent-monitor quota.
    pub fn is_active(&self) -> bool {
        matches!(self, MonitorStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStateRecord {
    pub tenant_id: TenantId,
    pub coin: String,
    pub monitor_id: String,
    pub status: MonitorStatus,
    pub last_active: DateTime<Utc>,
}

/// Stable monitor identifier, e.g. `"42:LTC"`.
pub fn monitor_id(tenant_id: TenantId, coin: &str) -> String {
    format!("{}:{}", tenant_id, coin.to_uppercase())
}

/// Shortens an address or txid for info-level logs.
pub fn short(value: &str) -> &str {
    match value.char_indices().nth(10) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
