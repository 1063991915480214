// core/blockchain-monitor/src/protocol.rs
// Blockbook-style JSON frames exchanged over the monitor socket

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use thiserror::Error;

use coinwatch_common::models::coins_to_satoshis;

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// Transaction notification carried by an inbound `subscribe` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub txid: String,
    pub address: String,
    pub amount_satoshis: u64,
    pub confirmations: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Transaction(TransactionEvent),
    /// `subscribe` frame without a txid or address.
    Incomplete,
    Ping(Value),
    Other(Option<String>),
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Transaction(_) => "transaction",
            InboundMessage::Incomplete => "incomplete",
            InboundMessage::Ping(_) => "ping",
            InboundMessage::Other(_) => "other",
        }
    }
}

pub fn subscribe_frame(address: &str) -> String {
    json!({"method": "subscribe", "params": {"address": address}}).to_string()
}

pub fn unsubscribe_frame(address: &str) -> String {
    json!({"method": "unsubscribe", "params": {"address": address}}).to_string()
}

/// Echoes the ping's params, or `{}` when it had none.
pub fn pong_frame(params: &Value) -> String {
    json!({"method": "pong", "params": params}).to_string()
}

/// Pong for an application-level ping frame, `None` for anything else.
pub fn ping_reply(text: &str) -> Option<String> {
    match parse_inbound(text) {
        Ok(InboundMessage::Ping(params)) => Some(pong_frame(&params)),
        _ => None,
    }
}

pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let message: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let method = message.get("method").and_then(Value::as_str);
    match method {
        Some("subscribe") => match message.get("params") {
            Some(params) => parse_transaction(params),
            None => Ok(InboundMessage::Other(Some("subscribe".to_string()))),
        },
        Some("ping") => Ok(InboundMessage::Ping(
            message.get("params").cloned().unwrap_or_else(|| json!({})),
        )),
        other => Ok(InboundMessage::Other(other.map(str::to_string))),
    }
}

fn parse_transaction(params: &Value) -> Result<InboundMessage, ProtocolError> {
    let txid = params.get("txid").and_then(Value::as_str).filter(|s| !s.is_empty());
    let address = params.get("address").and_then(Value::as_str).filter(|s| !s.is_empty());

    let (txid, address) = match (txid, address) {
        (Some(txid), Some(address)) => (txid, address),
        _ => return Ok(InboundMessage::Incomplete),
    };

    let amount_satoshis = match params.get("amount") {
        Some(amount) => parse_amount(amount)?,
        None => 0,
    };

    let confirmations = params
        .get("confirmations")
        .and_then(Value::as_u64)
        .map(|c| c.min(u32::MAX as u64) as u32)
        .unwrap_or(0);

    let timestamp = params
        .get("timestamp")
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    Ok(InboundMessage::Transaction(TransactionEvent {
        txid: txid.to_string(),
        address: address.to_string(),
        amount_satoshis,
        confirmations,
        timestamp,
    }))
}

/// Integers are satoshis; decimals (number or string) are coin units.
pub fn parse_amount(amount: &Value) -> Result<u64, ProtocolError> {
    let invalid = || ProtocolError::InvalidAmount(amount.to_string());

    match amount {
        Value::Number(n) => {
            if let Some(satoshis) = n.as_u64() {
                Ok(satoshis)
            } else {
                n.as_f64().and_then(coins_to_satoshis).ok_or_else(invalid)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if s.contains('.') {
                s.parse::<f64>()
                    .ok()
                    .and_then(coins_to_satoshis)
                    .ok_or_else(invalid)
            } else {
                s.parse::<u64>().map_err(|_| invalid())
            }
        }
        Value::Null => Ok(0),
        _ => Err(invalid()),
    }
}

/// Unix seconds (integer or fractional).
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}
