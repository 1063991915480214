// core/common/src/validation.rs
// Input validation for addresses, txids, coin symbols and sweep keys

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid transaction ID format: {0}")]
    InvalidTxid(String),
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid coin symbol: {0}")]
    InvalidCoin(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Input too long: {field} exceeds {max} characters")]
    InputTooLong { field: String, max: usize },
    #[error("Required field missing: {0}")]
    MissingField(String),
}

/// Shortest address the monitor accepts; format checks happen upstream.
pub const MIN_ADDRESS_LENGTH: usize = 26;
const MAX_ADDRESS_LENGTH: usize = 100;
const TXID_LENGTH: usize = 64;
/// Plausibility floor for a WIF key; not a cryptographic check.
pub const MIN_PRIVATE_KEY_LENGTH: usize = 30;
const MAX_COIN_SYMBOL_LENGTH: usize = 10;

/// Length gate applied before an address enters a watch set.
pub fn validate_monitored_address(address: &str) -> Result<(), ValidationError> {
    if address.is_empty() {
        return Err(ValidationError::InvalidAddress("address is empty".to_string()));
    }

    if address.len() < MIN_ADDRESS_LENGTH {
        return Err(ValidationError::InvalidAddress(format!(
            "must be at least {} characters",
            MIN_ADDRESS_LENGTH
        )));
    }

    if address.len() > MAX_ADDRESS_LENGTH {
        return Err(ValidationError::InputTooLong {
            field: "address".to_string(),
            max: MAX_ADDRESS_LENGTH,
        });
    }

    Ok(())
}

/// Stricter check for master/destination addresses: base58 or bech32 charset.
pub fn validate_address(address: &str) -> Result<(), ValidationError> {
    validate_monitored_address(address)?;

    let valid_chars_regex = Regex::new(
        r"^[123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz]+$|^[a-z]{1,5}1[02-9ac-hj-np-z]{20,87}$",
    )
    .map_err(|_| ValidationError::InvalidAddress("regex error".to_string()))?;

    if !valid_chars_regex.is_match(address) {
        return Err(ValidationError::InvalidAddress(
            "contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate transaction ID (64 hex characters)
pub fn validate_txid(txid: &str) -> Result<(), ValidationError> {
    if txid.len() != TXID_LENGTH {
        return Err(ValidationError::InvalidTxid(format!(
            "must be exactly {} characters",
            TXID_LENGTH
        )));
    }

    if !txid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidTxid(
            "must contain only hexadecimal characters".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_private_key_shape(key: &str) -> Result<(), ValidationError> {
    if key.trim().len() < MIN_PRIVATE_KEY_LENGTH {
        return Err(ValidationError::InvalidPrivateKey);
    }
    Ok(())
}

pub fn validate_coin_symbol(symbol: &str) -> Result<(), ValidationError> {
    if symbol.is_empty() {
        return Err(ValidationError::MissingField("coin".to_string()));
    }

    if symbol.len() > MAX_COIN_SYMBOL_LENGTH || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidCoin(symbol.to_string()));
    }

    Ok(())
}

/// Sanitize string input (remove control characters, limit length)
pub fn sanitize_string(input: &str, max_length: usize) -> String {
    input
        .chars()
        .filter(|c| !c.is_control())
        .take(max_length)
        .collect()
}
