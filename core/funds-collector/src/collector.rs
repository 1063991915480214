// core/funds-collector/src/collector.rs
// UTXO sweep: select confirmed outputs, build, sign and broadcast one transaction

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use coinwatch_common::{
    format_coins, generate_request_id, short, validate_address, validate_private_key_shape, Capability, CoinConfig,
    CollectionRecord, ComponentHealth, HealthStatus, MetricsSink, NoopMetrics, Persistence,
    TenancyError, TenancyGate, TenantId, ValidationError,
};
use coinwatch_node::{NodeApi, PrivateKey, TxInput, Utxo};

/// Failure count above which a collector with no successes is unhealthy.
const MAX_ERRORS_WITHOUT_SUCCESS: u64 = 10;
const STALE_AFTER_HOURS: i64 = 24;
const DEGRADED_ERROR_RATE: f64 = 0.3;

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("No UTXOs found")]
    NoUtxos,
    #[error("No confirmed UTXOs")]
    NoConfirmedUtxos,
    #[error("Amount too small: {}", format_coins(*.0))]
    AmountTooSmall(u64),
    #[error("Amount after fee is zero or negative")]
    AmountAfterFee,
    #[error("Failed to fetch UTXOs: {0}")]
    Utxos(String),
    #[error("Failed to create transaction: {0}")]
    Create(String),
    #[error("Failed to sign transaction: {0}")]
    Sign(String),
    #[error("Transaction signing not complete")]
    SigningIncomplete,
    #[error("Failed to send transaction: {0}")]
    Broadcast(String),
    #[error("No TXID in response")]
    MissingTxid,
    #[error(transparent)]
    Tenancy(#[from] TenancyError),
}

impl CollectionError {
    /// Empty or dust addresses are ordinary outcomes, not errors.
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            CollectionError::NoUtxos
                | CollectionError::NoConfirmedUtxos
                | CollectionError::AmountTooSmall(_)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReceipt {
    pub tenant_id: TenantId,
    pub txid: String,
    pub amount_sent: u64,
    pub total_amount: u64,
    pub fee: u64,
    pub from_address: String,
    pub to_address: String,
    pub coin: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub utxos_count: usize,
}

/// Read-only preview of what a sweep would do.
#[derive(Debug, Clone, Serialize)]
pub struct Eligibility {
    pub tenant_id: TenantId,
    pub can_collect: bool,
    pub confirmed_balance: u64,
    pub min_collection_amount: u64,
    pub collection_fee: u64,
    pub amount_after_fee: u64,
    pub coin: String,
    pub address: String,
}

/// JSON view of a sweep outcome for the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Confirmed total, reported when it was below the minimum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(flatten)]
    pub receipt: Option<CollectionReceipt>,
}

impl From<&Result<CollectionReceipt, CollectionError>> for CollectionResponse {
    fn from(result: &Result<CollectionReceipt, CollectionError>) -> Self {
        match result {
            Ok(receipt) => Self {
                success: true,
                error: None,
                amount: None,
                receipt: Some(receipt.clone()),
            },
            Err(e) => Self {
                success: false,
                error: Some(e.to_string()),
                amount: match e {
                    CollectionError::AmountTooSmall(total) => Some(*total),
                    _ => None,
                },
                receipt: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectorStats {
    pub tenant_id: TenantId,
    pub coin: String,
    pub master_address: String,
    pub collections: u64,
    pub successful_collections: u64,
    pub failed_collections: u64,
    pub success_rate: f64,
    pub total_collected: u64,
    pub errors: u64,
    pub last_collection: Option<DateTime<Utc>>,
    pub is_processing: bool,
}

#[derive(Default)]
struct Counters {
    collections: u64,
    successful: u64,
    failed: u64,
    total_collected: u64,
    errors: u64,
    last_collection: Option<DateTime<Utc>>,
    in_flight: usize,
}

/// Sweeps one tenant's addresses on one coin to the configured master address.
///
/// The private key is borrowed for the duration of a single call and only
/// handed to the node's signing request.
pub struct FundsCollector {
    tenant_id: TenantId,
    coin: CoinConfig,
    master_address: String,
    node: Arc<dyn NodeApi>,
    metrics: Arc<dyn MetricsSink>,
    gate: Option<TenancyGate>,
    counters: Mutex<Counters>,
}

struct InFlight<'a>(&'a Mutex<Counters>);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Mutex<Counters>) -> Self {
        counters.lock().unwrap_or_else(|e| e.into_inner()).in_flight += 1;
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut counters = self.0.lock().unwrap_or_else(|e| e.into_inner());
        counters.in_flight = counters.in_flight.saturating_sub(1);
    }
}

impl FundsCollector {
    pub fn new(
        tenant_id: TenantId,
        coin: CoinConfig,
        master_address: impl Into<String>,
        node: Arc<dyn NodeApi>,
    ) -> Result<Self, ValidationError> {
        let master_address = master_address.into();
        validate_address(&master_address)?;

        Ok(Self {
            tenant_id,
            coin,
            master_address,
            node,
            metrics: Arc::new(NoopMetrics),
            gate: None,
            counters: Mutex::new(Counters::default()),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Requires `can_collect_funds` and counts each sweep as an API call.
    pub fn with_gate(mut self, gate: TenancyGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn coin(&self) -> &str {
        &self.coin.symbol
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn collect_funds(
        &self,
        address: &str,
        private_key: &PrivateKey,
        persistence: Option<&dyn Persistence>,
    ) -> Result<CollectionReceipt, CollectionError> {
        let started = Instant::now();
        let _in_flight = InFlight::enter(&self.counters);
        let request_id = generate_request_id();

        info!(
            request_id = %request_id,
            tenant_id = %self.tenant_id,
            coin = %self.coin.symbol,
            address = %short(address),
            "Starting funds collection"
        );

        match self.sweep(address, private_key, started).await {
            Ok(receipt) => {
                {
                    let mut counters = self.counters();
                    counters.collections += 1;
                    counters.successful += 1;
                    counters.total_collected += receipt.amount_sent;
                    counters.last_collection = Some(receipt.timestamp);
                }

                info!(
                    request_id = %request_id,
                    tenant_id = %self.tenant_id,
                    coin = %self.coin.symbol,
                    address = %short(address),
                    txid = %receipt.txid,
                    amount = %format_coins(receipt.amount_sent),
                    duration_ms = receipt.duration_ms,
                    "Funds collected"
                );

                if let Some(store) = persistence {
                    self.save_record(store, &receipt).await;
                }

                self.metrics
                    .health_status(&self.coin.symbol, "collector", "collection", true);
                self.metrics
                    .funds_collection(&self.coin.symbol, "success", receipt.amount_sent);
                Ok(receipt)
            }
            Err(e) => {
                {
                    let mut counters = self.counters();
                    counters.failed += 1;
                    if e.is_error() {
                        counters.errors += 1;
                    }
                }

                if e.is_error() {
                    error!(
                        request_id = %request_id,
                        tenant_id = %self.tenant_id,
                        coin = %self.coin.symbol,
                        address = %short(address),
                        error = %e,
                        "Funds collection failed"
                    );
                } else {
                    info!(
                        tenant_id = %self.tenant_id,
                        coin = %self.coin.symbol,
                        address = %short(address),
                        reason = %e,
                        "Nothing to collect"
                    );
                }
                self.metrics.funds_collection(&self.coin.symbol, "failed", 0);
                Err(e)
            }
        }
    }

    async fn sweep(
        &self,
        address: &str,
        private_key: &PrivateKey,
        started: Instant,
    ) -> Result<CollectionReceipt, CollectionError> {
        validate_private_key_shape(private_key.expose_secret())
            .map_err(|_| CollectionError::InvalidPrivateKey)?;

        if let Some(gate) = &self.gate {
            gate.require_capability(self.tenant_id, Capability::CollectFunds)
                .await?;
            gate.record_api_call(self.tenant_id, "collect_funds").await?;
        }

        let utxos = self.confirmed_utxos(address).await?;
        let total: u64 = utxos.iter().map(|u| u.amount_satoshis).sum();
        let amount_to_send = self.amount_after_fee(total)?;

        let inputs: Vec<TxInput> = utxos.iter().map(TxInput::from).collect();
        let outputs = vec![(self.master_address.clone(), amount_to_send)];

        let raw_tx = self
            .node
            .create_raw_tx(&inputs, &outputs)
            .await
            .map_err(|e| CollectionError::Create(e.to_string()))?;

        let signed = self
            .node
            .sign_raw_tx(&raw_tx, private_key)
            .await
            .map_err(|e| CollectionError::Sign(e.to_string()))?;
        if !signed.complete {
            return Err(CollectionError::SigningIncomplete);
        }

        let txid = self
            .node
            .broadcast_raw_tx(&signed.hex)
            .await
            .map_err(|e| CollectionError::Broadcast(e.to_string()))?;
        if txid.trim().is_empty() {
            return Err(CollectionError::MissingTxid);
        }

        Ok(CollectionReceipt {
            tenant_id: self.tenant_id,
            txid,
            amount_sent: amount_to_send,
            total_amount: total,
            fee: self.coin.collection_fee,
            from_address: address.to_string(),
            to_address: self.master_address.clone(),
            coin: self.coin.symbol.clone(),
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            utxos_count: utxos.len(),
        })
    }

    /// UTXOs with at least one confirmation; errors when there are none.
    async fn confirmed_utxos(&self, address: &str) -> Result<Vec<Utxo>, CollectionError> {
        let utxos = self
            .node
            .get_utxos(address)
            .await
            .map_err(|e| CollectionError::Utxos(e.to_string()))?;
        if utxos.is_empty() {
            return Err(CollectionError::NoUtxos);
        }

        let confirmed: Vec<Utxo> = utxos.into_iter().filter(|u| u.confirmations >= 1).collect();
        if confirmed.is_empty() {
            return Err(CollectionError::NoConfirmedUtxos);
        }
        Ok(confirmed)
    }

    fn amount_after_fee(&self, total: u64) -> Result<u64, CollectionError> {
        if total < self.coin.min_collection_amount {
            return Err(CollectionError::AmountTooSmall(total));
        }
        match total.checked_sub(self.coin.collection_fee) {
            Some(amount) if amount > 0 => Ok(amount),
            _ => Err(CollectionError::AmountAfterFee),
        }
    }

    async fn save_record(&self, store: &dyn Persistence, receipt: &CollectionReceipt) {
        let record = CollectionRecord {
            tenant_id: self.tenant_id,
            coin: receipt.coin.clone(),
            address: receipt.from_address.clone(),
            txid: receipt.txid.clone(),
            amount_sent_satoshis: receipt.amount_sent,
            total_satoshis: receipt.total_amount,
            fee_satoshis: receipt.fee,
            master_address: receipt.to_address.clone(),
            timestamp: receipt.timestamp,
        };

        match store.save_collection(&record).await {
            Ok(()) => debug!(txid = %receipt.txid, "Collection record saved"),
            Err(e) => error!(txid = %receipt.txid, error = %e, "Error saving collection record"),
        }
    }

    pub async fn check_collection_eligibility(
        &self,
        address: &str,
    ) -> Result<Eligibility, CollectionError> {
        let utxos = self
            .node
            .get_utxos(address)
            .await
            .map_err(|e| CollectionError::Utxos(e.to_string()))?;

        let confirmed_balance: u64 = utxos
            .iter()
            .filter(|u| u.confirmations >= 1)
            .map(|u| u.amount_satoshis)
            .sum();
        let amount_after_fee = self.amount_after_fee(confirmed_balance).unwrap_or(0);

        Ok(Eligibility {
            tenant_id: self.tenant_id,
            can_collect: amount_after_fee > 0,
            confirmed_balance,
            min_collection_amount: self.coin.min_collection_amount,
            collection_fee: self.coin.collection_fee,
            amount_after_fee,
            coin: self.coin.symbol.clone(),
            address: address.to_string(),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now())
    }

    fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        let counters = self.counters();
        if counters.errors > MAX_ERRORS_WITHOUT_SUCCESS && counters.collections == 0 {
            return false;
        }
        if let Some(last) = counters.last_collection {
            if now - last > ChronoDuration::hours(STALE_AFTER_HOURS) && counters.errors > 0 {
                return false;
            }
        }
        true
    }

    /// Unhealthy per `is_healthy`, degraded above a 30% error rate.
    pub fn health_check(&self) -> ComponentHealth {
        let stats = self.get_stats();
        let attempts = stats.successful_collections + stats.failed_collections;
        let error_rate = if attempts > 0 {
            stats.errors as f64 / attempts as f64
        } else {
            0.0
        };

        let (status, message) = if !self.is_healthy() {
            (HealthStatus::Unhealthy, "Collector failing")
        } else if error_rate > DEGRADED_ERROR_RATE {
            (HealthStatus::Degraded, "High collection error rate")
        } else {
            (HealthStatus::Healthy, "Collector operational")
        };

        self.metrics.health_status(
            &self.coin.symbol,
            "collector",
            "status",
            status.is_healthy(),
        );

        ComponentHealth::new(format!("collector:{}:{}", self.tenant_id, self.coin.symbol), status)
            .with_coin(&self.coin.symbol)
            .with_message(message)
            .with_details(json!({
                "collections": stats.collections,
                "errors": stats.errors,
                "error_rate": error_rate,
                "last_collection": stats.last_collection,
            }))
    }

    pub fn get_stats(&self) -> CollectorStats {
        let counters = self.counters();
        let attempts = counters.successful + counters.failed;
        CollectorStats {
            tenant_id: self.tenant_id,
            coin: self.coin.symbol.clone(),
            master_address: format!("{}...", short(&self.master_address)),
            collections: counters.collections,
            successful_collections: counters.successful,
            failed_collections: counters.failed,
            success_rate: if attempts > 0 {
                counters.successful as f64 / attempts as f64
            } else {
                0.0
            },
            total_collected: counters.total_collected,
            errors: counters.errors,
            last_collection: counters.last_collection,
            is_processing: counters.in_flight > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coinwatch_common::{MemoryStore, Quota, QuotaStore};
    use coinwatch_node::{AddressInfo, NodeError, SignedTx};

    const SOURCE: &str = "LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3";
    const MASTER: &str = "LZ1GWQ8bQFeRNpdvDB5HnVYXqX4wNc8Tfk";
    const KEY: &str = "T8uZkNbmdv3JHC6pYP9EKBqsuQoRXu9Xq1HM4bWQeHcPgjqFqFj2";

    fn utxo(n: u8, amount_satoshis: u64, confirmations: u32) -> Utxo {
        Utxo {
            txid: format!("{:02x}", n).repeat(32),
            vout: n as u32,
            amount_satoshis,
            confirmations,
        }
    }

    #[derive(Default)]
    struct FakeNode {
        utxos: Vec<Utxo>,
        complete: bool,
        broadcast_result: Option<String>,
        created: Mutex<Option<(Vec<TxInput>, Vec<(String, u64)>)>>,
        signed_with: Mutex<Option<String>>,
    }

    impl FakeNode {
        fn with_utxos(utxos: Vec<Utxo>) -> Self {
            Self {
                utxos,
                complete: true,
                broadcast_result: Some("f00d".repeat(16)),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl NodeApi for FakeNode {
        fn coin(&self) -> &str {
            "LTC"
        }

        async fn get_utxos(&self, _address: &str) -> Result<Vec<Utxo>, NodeError> {
            Ok(self.utxos.clone())
        }

        async fn get_address_info(&self, address: &str) -> Result<AddressInfo, NodeError> {
            Ok(AddressInfo {
                address: address.to_string(),
                balance: self.utxos.iter().map(|u| u.amount_satoshis).sum(),
                unconfirmed_balance: 0,
                txs: self.utxos.len() as u64,
                txids: Vec::new(),
            })
        }

        async fn create_raw_tx(
            &self,
            inputs: &[TxInput],
            outputs: &[(String, u64)],
        ) -> Result<String, NodeError> {
            *self.created.lock().unwrap() = Some((inputs.to_vec(), outputs.to_vec()));
            Ok("0200raw".to_string())
        }

        async fn sign_raw_tx(&self, raw_hex: &str, key: &PrivateKey) -> Result<SignedTx, NodeError> {
            assert_eq!(raw_hex, "0200raw");
            *self.signed_with.lock().unwrap() = Some(key.expose_secret().to_string());
            Ok(SignedTx {
                hex: "0200signed".to_string(),
                complete: self.complete,
            })
        }

        async fn broadcast_raw_tx(&self, _signed_hex: &str) -> Result<String, NodeError> {
            match &self.broadcast_result {
                Some(txid) => Ok(txid.clone()),
                None => Err(NodeError::Rpc {
                    code: -26,
                    message: "mandatory-script-verify-flag-failed".to_string(),
                }),
            }
        }
    }

    fn collector(node: Arc<FakeNode>) -> FundsCollector {
        FundsCollector::new(TenantId(3), CoinConfig::for_symbol("LTC"), MASTER, node).unwrap()
    }

    #[tokio::test]
    async fn test_sweep_sends_total_minus_fee_in_one_output() {
        let node = Arc::new(FakeNode::with_utxos(vec![
            utxo(1, 60_000_000, 2),
            utxo(2, 50_000_000, 1),
        ]));
        let store = MemoryStore::new();
        let collector = collector(node.clone());

        let receipt = collector
            .collect_funds(SOURCE, &PrivateKey::new(KEY), Some(&store))
            .await
            .unwrap();

        assert_eq!(receipt.total_amount, 110_000_000);
        assert_eq!(receipt.amount_sent, 109_990_000);
        assert_eq!(receipt.fee, 10_000);
        assert_eq!(receipt.utxos_count, 2);
        assert_eq!(receipt.to_address, MASTER);

        let (inputs, outputs) = node.created.lock().unwrap().clone().unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(outputs, vec![(MASTER.to_string(), 109_990_000)]);
        assert_eq!(format_coins(outputs[0].1), "1.09990000");
        assert_eq!(node.signed_with.lock().unwrap().as_deref(), Some(KEY));

        let records = store
            .get_collections_for_address(TenantId(3), "LTC", SOURCE)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].txid, receipt.txid);

        let stats = collector.get_stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.total_collected, 109_990_000);
        assert!(!stats.is_processing);
        assert_eq!(stats.master_address, "LZ1GWQ8bQF...");
    }

    #[tokio::test]
    async fn test_dust_rejected_without_record() {
        let node = Arc::new(FakeNode::with_utxos(vec![utxo(1, 50_000, 6)]));
        let store = MemoryStore::new();
        let collector = collector(node.clone());

        let err = collector
            .collect_funds(SOURCE, &PrivateKey::new(KEY), Some(&store))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Amount too small: 0.00050000");
        assert!(node.created.lock().unwrap().is_none());
        assert_eq!(store.collection_count().await, 0);

        let stats = collector.get_stats();
        assert_eq!(stats.failed_collections, 1);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_short_key_rejected_before_node_calls() {
        let node = Arc::new(FakeNode::with_utxos(vec![utxo(1, 60_000_000, 2)]));
        let collector = collector(node.clone());

        let err = collector
            .collect_funds(SOURCE, &PrivateKey::new("too-short"), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid private key");
        assert!(node.created.lock().unwrap().is_none());
        assert_eq!(collector.get_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_empty_and_unconfirmed_outcomes() {
        let collector_empty = collector(Arc::new(FakeNode::with_utxos(vec![])));
        let err = collector_empty
            .collect_funds(SOURCE, &PrivateKey::new(KEY), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No UTXOs found");

        let collector_pending =
            collector(Arc::new(FakeNode::with_utxos(vec![utxo(1, 60_000_000, 0)])));
        let err = collector_pending
            .collect_funds(SOURCE, &PrivateKey::new(KEY), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No confirmed UTXOs");
    }

    #[tokio::test]
    async fn test_fee_swallowing_balance() {
        let coin = CoinConfig {
            min_collection_amount: 10_000,
            collection_fee: 10_000,
            ..CoinConfig::for_symbol("LTC")
        };
        let node = Arc::new(FakeNode::with_utxos(vec![utxo(1, 10_000, 3)]));
        let collector = FundsCollector::new(TenantId(3), coin, MASTER, node).unwrap();

        let err = collector
            .collect_funds(SOURCE, &PrivateKey::new(KEY), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Amount after fee is zero or negative");
    }

    #[tokio::test]
    async fn test_incomplete_signature_and_broadcast_failure() {
        let node = Arc::new(FakeNode {
            complete: false,
            ..FakeNode::with_utxos(vec![utxo(1, 60_000_000, 2)])
        });
        let store = MemoryStore::new();
        let err = collector(node)
            .collect_funds(SOURCE, &PrivateKey::new(KEY), Some(&store))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::SigningIncomplete));

        let node = Arc::new(FakeNode {
            broadcast_result: None,
            ..FakeNode::with_utxos(vec![utxo(1, 60_000_000, 2)])
        });
        let err = collector(node)
            .collect_funds(SOURCE, &PrivateKey::new(KEY), Some(&store))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::Broadcast(_)));
        assert_eq!(store.collection_count().await, 0);
    }

    #[tokio::test]
    async fn test_gate_requires_collect_capability() {
        let store = MemoryStore::new();
        store.set_quota(TenantId(3), &Quota::default()).await.unwrap();
        let node = Arc::new(FakeNode::with_utxos(vec![utxo(1, 60_000_000, 2)]));
        let collector = collector(node.clone()).with_gate(TenancyGate::new(Arc::new(store.clone())));

        let err = collector
            .collect_funds(SOURCE, &PrivateKey::new(KEY), Some(&store))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CollectionError::Tenancy(TenancyError::PermissionDenied { .. })
        ));

        store
            .set_quota(
                TenantId(3),
                &Quota {
                    can_collect_funds: true,
                    ..Quota::default()
                },
            )
            .await
            .unwrap();
        collector
            .collect_funds(SOURCE, &PrivateKey::new(KEY), Some(&store))
            .await
            .unwrap();
        assert_eq!(store.count_api_calls_today(TenantId(3)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_eligibility_preview() {
        let node = Arc::new(FakeNode::with_utxos(vec![
            utxo(1, 60_000_000, 2),
            utxo(2, 50_000_000, 0),
        ]));
        let eligibility = collector(node.clone())
            .check_collection_eligibility(SOURCE)
            .await
            .unwrap();
        assert!(eligibility.can_collect);
        assert_eq!(eligibility.confirmed_balance, 60_000_000);
        assert_eq!(eligibility.amount_after_fee, 59_990_000);
        assert!(node.created.lock().unwrap().is_none());

        let dust = collector(Arc::new(FakeNode::with_utxos(vec![utxo(1, 50_000, 2)])))
            .check_collection_eligibility(SOURCE)
            .await
            .unwrap();
        assert!(!dust.can_collect);
        assert_eq!(dust.amount_after_fee, 0);
    }

    #[tokio::test]
    async fn test_health_rules() {
        let collector = collector(Arc::new(FakeNode::with_utxos(vec![])));
        assert!(collector.is_healthy());

        for _ in 0..11 {
            let _ = collector
                .collect_funds(SOURCE, &PrivateKey::new("bad"), None)
                .await;
        }
        assert!(!collector.is_healthy());
        assert_eq!(collector.health_check().status, HealthStatus::Unhealthy);

        let recovering = self::collector(Arc::new(FakeNode::with_utxos(vec![])));
        {
            let mut counters = recovering.counters();
            counters.collections = 1;
            counters.successful = 1;
            counters.errors = 1;
            counters.failed = 1;
            counters.last_collection = Some(Utc::now() - ChronoDuration::hours(25));
        }
        assert!(!recovering.is_healthy_at(Utc::now()));
        assert!(recovering.is_healthy_at(Utc::now() - ChronoDuration::hours(2)));
    }

    #[tokio::test]
    async fn test_degraded_on_error_rate() {
        let collector = collector(Arc::new(FakeNode::with_utxos(vec![utxo(1, 60_000_000, 2)])));
        collector
            .collect_funds(SOURCE, &PrivateKey::new(KEY), None)
            .await
            .unwrap();
        let _ = collector
            .collect_funds(SOURCE, &PrivateKey::new("bad"), None)
            .await;

        let health = collector.health_check();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.coin.as_deref(), Some("LTC"));
    }

    #[test]
    fn test_response_shape() {
        let failure: Result<CollectionReceipt, CollectionError> =
            Err(CollectionError::AmountTooSmall(50_000));
        let value = serde_json::to_value(CollectionResponse::from(&failure)).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "Amount too small: 0.00050000");
        assert_eq!(value["amount"], 50_000);
        assert!(value.get("txid").is_none());

        let success: Result<CollectionReceipt, CollectionError> = Ok(CollectionReceipt {
            tenant_id: TenantId(3),
            txid: "ab".repeat(32),
            amount_sent: 109_990_000,
            total_amount: 110_000_000,
            fee: 10_000,
            from_address: SOURCE.to_string(),
            to_address: MASTER.to_string(),
            coin: "LTC".to_string(),
            timestamp: Utc::now(),
            duration_ms: 12,
            utxos_count: 2,
        });
        let value = serde_json::to_value(CollectionResponse::from(&success)).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["amount_sent"], 109_990_000);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_private_key_not_in_debug_output() {
        let key = PrivateKey::new(KEY);
        assert!(!format!("{:?}", key).contains(KEY));
    }

    #[test]
    fn test_invalid_master_address_rejected() {
        let node = Arc::new(FakeNode::default());
        assert!(FundsCollector::new(TenantId(3), CoinConfig::for_symbol("LTC"), "0OIl", node).is_err());
    }
}
