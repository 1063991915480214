// core/node-client/src/client.rs
// Remote node client: Blockbook REST for UTXOs, JSON-RPC 2.0 for raw transactions

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

use coinwatch_common::{format_coins, CoinConfig, MetricsSink, NoopMetrics};

use crate::pool::{ConnectionPool, PoolError};

const RPC_ID: &str = "blockchain_module";

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        NodeError::Http(err.to_string())
    }
}

/// Signing key for one sweep. Never printed, serialized or stored.
#[derive(Clone)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub amount_satoshis: u64,
    pub confirmations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
}

impl From<&Utxo> for TxInput {
    fn from(utxo: &Utxo) -> Self {
        Self {
            txid: utxo.txid.clone(),
            vout: utxo.vout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignedTx {
    pub hex: String,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressInfo {
    pub address: String,
    #[serde(deserialize_with = "satoshis_from_any")]
    pub balance: u64,
    #[serde(default, deserialize_with = "signed_satoshis_from_any")]
    pub unconfirmed_balance: i64,
    #[serde(default)]
    pub txs: u64,
    #[serde(default)]
    pub txids: Vec<String>,
}

/// Blockbook UTXO entry; `value` is a satoshi string.
#[derive(Debug, Deserialize)]
struct BlockbookUtxo {
    txid: String,
    vout: u32,
    #[serde(deserialize_with = "satoshis_from_any")]
    value: u64,
    #[serde(default)]
    confirmations: u32,
}

fn satoshis_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("not a satoshi amount: {}", n))),
        other => Err(serde::de::Error::custom(format!("not a satoshi amount: {}", other))),
    }
}

fn signed_satoshis_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => s.parse().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("not a satoshi amount: {}", n))),
        other => Err(serde::de::Error::custom(format!("not a satoshi amount: {}", other))),
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Operations the collector and backfill need from a remote node.
#[async_trait]
pub trait NodeApi: Send + Sync {
    fn coin(&self) -> &str;

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, NodeError>;

    async fn get_address_info(&self, address: &str) -> Result<AddressInfo, NodeError>;

    /// `outputs` maps address to satoshis; amounts go over the wire in coin units.
    async fn create_raw_tx(
        &self,
        inputs: &[TxInput],
        outputs: &[(String, u64)],
    ) -> Result<String, NodeError>;

    async fn sign_raw_tx(&self, raw_hex: &str, key: &PrivateKey) -> Result<SignedTx, NodeError>;

    async fn broadcast_raw_tx(&self, signed_hex: &str) -> Result<String, NodeError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStats {
    pub coin: String,
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub avg_response_ms: f64,
    pub last_request: Option<DateTime<Utc>>,
    pub api_key_configured: bool,
}

#[derive(Default)]
struct Counters {
    requests: u64,
    errors: u64,
    total_response_ms: f64,
    last_request: Option<DateTime<Utc>>,
}

pub struct NodeClient {
    coin: String,
    blockbook_url: String,
    rpc_url: String,
    api_key: String,
    pool: Arc<ConnectionPool>,
    metrics: Arc<dyn MetricsSink>,
    counters: Mutex<Counters>,
}

impl NodeClient {
    pub fn new(config: &CoinConfig, api_key: &str, pool: Arc<ConnectionPool>) -> Self {
        Self {
            coin: config.symbol.clone(),
            blockbook_url: config.blockbook_url.trim_end_matches('/').to_string(),
            rpc_url: config.rpc_url.clone(),
            api_key: api_key.to_string(),
            pool,
            metrics: Arc::new(NoopMetrics),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn record(&self, endpoint: &str, started: Instant, outcome: Result<(), &str>) {
        let elapsed = started.elapsed();
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.requests += 1;
            counters.total_response_ms += elapsed.as_secs_f64() * 1000.0;
            counters.last_request = Some(Utc::now());
            if outcome.is_err() {
                counters.errors += 1;
            }
        }

        self.metrics
            .api_request(&self.coin, endpoint, outcome.is_ok(), elapsed.as_secs_f64());
        if let Err(error_type) = outcome {
            self.metrics.api_error(&self.coin, endpoint, error_type);
        }
    }

    fn error_type(err: &NodeError) -> &'static str {
        match err {
            NodeError::Http(_) => "http",
            NodeError::Status { .. } => "status",
            NodeError::Rpc { .. } => "rpc",
            NodeError::InvalidResponse(_) => "invalid_response",
            NodeError::Pool(_) => "pool",
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, endpoint: &str) -> Result<T, NodeError> {
        let started = Instant::now();
        let result = self.fetch_json(path).await;
        self.record(endpoint, started, result.as_ref().map(|_| ()).map_err(Self::error_type));
        result
    }

    async fn fetch_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, NodeError> {
        let http = self.pool.acquire_http_session().await?;
        let url = format!("{}{}", self.blockbook_url, path);

        let mut request = http.get(&url);
        if !self.api_key.is_empty() {
            request = request.header("api-key", &self.api_key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(coin = %self.coin, url = %url, status = status.as_u16(), "Blockbook request failed");
            return Err(NodeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| NodeError::InvalidResponse(e.to_string()))
    }

    /// JSON-RPC 2.0 call against the coin's node.
    pub async fn call_rpc<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, NodeError> {
        let started = Instant::now();
        let result = self.send_rpc(method, params).await;
        self.record("rpc", started, result.as_ref().map(|_| ()).map_err(Self::error_type));
        result
    }

    async fn send_rpc<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, NodeError> {
        let http = self.pool.acquire_http_session().await?;
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: RPC_ID,
            method,
            params,
        };

        let mut builder = http.post(&self.rpc_url).json(&request);
        if !self.api_key.is_empty() {
            builder = builder.header("api-key", &self.api_key);
        }
        let response = builder.send().await?;

        let status = response.status();
        let body = response.text().await?;

        // Nodes report RPC failures with a 500 and an error body
        let parsed: RpcResponse<T> = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => {
                return Err(NodeError::InvalidResponse(e.to_string()))
            }
            Err(_) => {
                return Err(NodeError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        };

        if let Some(error) = parsed.error {
            warn!(coin = %self.coin, method, code = error.code, message = %error.message, "RPC error");
            return Err(NodeError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        parsed
            .result
            .ok_or_else(|| NodeError::InvalidResponse(format!("no result for {}", method)))
    }

    pub fn stats(&self) -> ClientStats {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let (error_rate, avg_response_ms) = if counters.requests > 0 {
            (
                counters.errors as f64 / counters.requests as f64,
                counters.total_response_ms / counters.requests as f64,
            )
        } else {
            (0.0, 0.0)
        };

        ClientStats {
            coin: self.coin.clone(),
            requests: counters.requests,
            errors: counters.errors,
            error_rate,
            avg_response_ms,
            last_request: counters.last_request,
            api_key_configured: !self.api_key.is_empty(),
        }
    }

    /// Unhealthy without an API key, above 50% errors, or idle for 5 minutes after use.
    pub fn is_healthy(&self) -> bool {
        if self.api_key.is_empty() {
            return false;
        }

        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if counters.errors as f64 > counters.requests as f64 * 0.5 {
            return false;
        }

        match counters.last_request {
            Some(last) if counters.requests > 0 => {
                Utc::now().signed_duration_since(last).num_seconds() <= 300
            }
            _ => true,
        }
    }
}

#[async_trait]
impl NodeApi for NodeClient {
    fn coin(&self) -> &str {
        &self.coin
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, NodeError> {
        let entries: Vec<Value> = self
            .get_json(&format!("/api/v2/utxo/{}", address), "utxo")
            .await?;

        let mut utxos = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<BlockbookUtxo>(entry) {
                Ok(u) => utxos.push(Utxo {
                    txid: u.txid,
                    vout: u.vout,
                    amount_satoshis: u.value,
                    confirmations: u.confirmations,
                }),
                Err(e) => warn!(coin = %self.coin, error = %e, "Skipping malformed UTXO"),
            }
        }

        debug!(coin = %self.coin, count = utxos.len(), "Fetched UTXOs");
        Ok(utxos)
    }

    async fn get_address_info(&self, address: &str) -> Result<AddressInfo, NodeError> {
        self.get_json(&format!("/api/v2/address/{}", address), "address")
            .await
    }

    async fn create_raw_tx(
        &self,
        inputs: &[TxInput],
        outputs: &[(String, u64)],
    ) -> Result<String, NodeError> {
        let mut output_map = serde_json::Map::new();
        for (address, satoshis) in outputs {
            let coins: Value = format_coins(*satoshis)
                .parse::<serde_json::Number>()
                .map(Value::Number)
                .map_err(|e| NodeError::InvalidResponse(e.to_string()))?;
            output_map.insert(address.clone(), coins);
        }

        self.call_rpc(
            "createrawtransaction",
            vec![json!(inputs), Value::Object(output_map)],
        )
        .await
    }

    async fn sign_raw_tx(&self, raw_hex: &str, key: &PrivateKey) -> Result<SignedTx, NodeError> {
        self.call_rpc(
            "signrawtransactionwithkey",
            vec![json!(raw_hex), json!([key.expose_secret()])],
        )
        .await
    }

    async fn broadcast_raw_tx(&self, signed_hex: &str) -> Result<String, NodeError> {
        self.call_rpc("sendrawtransaction", vec![json!(signed_hex)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolSettings;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> NodeClient {
        let mut config = CoinConfig::for_symbol("LTC");
        config.blockbook_url = server.url();
        config.rpc_url = server.url();
        NodeClient::new(&config, "test-key", Arc::new(ConnectionPool::new(PoolSettings::default())))
    }

    #[tokio::test]
    async fn test_get_utxos_parses_satoshi_strings() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v2/utxo/LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3")
            .match_header("api-key", "test-key")
            .with_status(200)
            .with_body(
                r#"[
                    {"txid":"aa","vout":0,"value":"60000000","confirmations":4},
                    {"txid":"bb","vout":1,"value":"50000000","confirmations":0},
                    {"txid":"cc","vout":"bad","value":"1"}
                ]"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let utxos = client
            .get_utxos("LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(utxos.len(), 2);
        assert_eq!(utxos[0].amount_satoshis, 60_000_000);
        assert_eq!(utxos[1].confirmations, 0);
        assert_eq!(client.stats().requests, 1);
    }

    #[tokio::test]
    async fn test_http_error_is_counted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex("^/api/v2/utxo/.*".to_string()))
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let client = client_for(&server);
        let result = client.get_utxos("LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3").await;

        assert!(matches!(result, Err(NodeError::Status { status: 503, .. })));
        let stats = client.stats();
        assert_eq!(stats.errors, 1);
        assert!(!client.is_healthy());
    }

    #[tokio::test]
    async fn test_create_raw_tx_sends_coin_units() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({
                "jsonrpc": "2.0",
                "id": "blockchain_module",
                "method": "createrawtransaction",
                "params": [
                    [{"txid": "aa", "vout": 0}, {"txid": "bb", "vout": 1}],
                    {"MMasterAddressxxxxxxxxxxxxxxxxxxx": 1.0999}
                ]
            })))
            .with_status(200)
            .with_body(r#"{"result":"0200raw","error":null,"id":"blockchain_module"}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let inputs = vec![
            TxInput { txid: "aa".to_string(), vout: 0 },
            TxInput { txid: "bb".to_string(), vout: 1 },
        ];
        let raw = client
            .create_raw_tx(
                &inputs,
                &[("MMasterAddressxxxxxxxxxxxxxxxxxxx".to_string(), 109_990_000)],
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(raw, "0200raw");
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(500)
            .with_body(
                r#"{"result":null,"error":{"code":-26,"message":"bad-txns-inputs-missingorspent"},"id":"blockchain_module"}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        match client.broadcast_raw_tx("0200signed").await {
            Err(NodeError::Rpc { code, message }) => {
                assert_eq!(code, -26);
                assert!(message.contains("missingorspent"));
            }
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sign_raw_tx_reports_incomplete() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({"method": "signrawtransactionwithkey"})))
            .with_status(200)
            .with_body(r#"{"result":{"hex":"0200half","complete":false},"error":null}"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let signed = client
            .sign_raw_tx("0200raw", &PrivateKey::new("T8xcWqS6yB3ZZT1JqNo4JTcTfzz4xvK8jJKQ6Zf1VqKqRTnEW7Ke"))
            .await
            .unwrap();
        assert!(!signed.complete);
    }

    #[tokio::test]
    async fn test_address_info() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v2/address/LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3")
            .with_status(200)
            .with_body(
                r#"{"address":"LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3","balance":"110000000","unconfirmedBalance":"-5000","txs":2,"txids":["aa","bb"]}"#,
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let info = client
            .get_address_info("LQTpS3VaYTjCr4s9Y1t5zbeY26zevf7Fb3")
            .await
            .unwrap();
        assert_eq!(info.balance, 110_000_000);
        assert_eq!(info.unconfirmed_balance, -5_000);
        assert_eq!(info.txids.len(), 2);
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let key = PrivateKey::new("T8xcWqS6yB3ZZT1JqNo4JTcTfzz4xvK8jJKQ6Zf1VqKqRTnEW7Ke");
        let printed = format!("{:?}", key);
        assert!(!printed.contains("T8xc"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_client_without_key_is_unhealthy() {
        let config = CoinConfig::for_symbol("DOGE");
        let client = NodeClient::new(&config, "", Arc::new(ConnectionPool::default()));
        assert!(!client.is_healthy());
        assert!(!client.stats().api_key_configured);
    }
}
