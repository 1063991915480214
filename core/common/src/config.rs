// core/common/src/config.rs
// Coin table and module settings, read once from the environment

use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8084";

/// Per-coin parameters. Amounts are in satoshis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinConfig {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub blockbook_url: String,
    pub rpc_url: String,
    pub required_confirmations: u32,
    pub min_collection_amount: u64,
    pub collection_fee: u64,
}

impl CoinConfig {
    /// Built-in entry for a known symbol, or a generic nownodes entry otherwise.
    pub fn for_symbol(symbol: &str) -> Self {
        let symbol = symbol.to_uppercase();
        match symbol.as_str() {
            "LTC" => Self {
                name: "Litecoin".to_string(),
                blockbook_url: "https://ltcbook.nownodes.io".to_string(),
                rpc_url: "https://ltc.nownodes.io".to_string(),
                required_confirmations: 3,
                min_collection_amount: 100_000,
                collection_fee: 10_000,
                ..Self::generic(&symbol)
            },
            "DOGE" => Self {
                name: "Dogecoin".to_string(),
                blockbook_url: "https://dogebook.nownodes.io".to_string(),
                rpc_url: "https://doge.nownodes.io".to_string(),
                required_confirmations: 6,
                min_collection_amount: 100_000_000,
                collection_fee: 10_000_000,
                ..Self::generic(&symbol)
            },
            _ => Self::generic(&symbol),
        }
    }

    fn generic(symbol: &str) -> Self {
        let lower = symbol.to_lowercase();
        Self {
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            decimals: 8,
            blockbook_url: format!("https://{}book.nownodes.io", lower),
            rpc_url: format!("https://{}.nownodes.io", lower),
            required_confirmations: 3,
            min_collection_amount: 100_000,
            collection_fee: 10_000,
        }
    }

    /// WebSocket endpoint derived from the Blockbook URL.
    pub fn ws_url(&self) -> String {
        if let Some(rest) = self.blockbook_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.blockbook_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.blockbook_url.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub api_key: String,
    pub connection_pool_size: usize,
    pub max_reconnect_attempts: u32,
    pub database_url: Option<String>,
    pub bind_address: String,
    pub webhook_url: Option<String>,
    pub coins: HashMap<String, CoinConfig>,
    pub master_addresses: HashMap<String, String>,
}

impl ModuleSettings {
    pub fn from_env() -> Self {
        dotenv().ok();

        let coins: HashMap<String, CoinConfig> = std::env::var("COINS")
            .unwrap_or_else(|_| "LTC,DOGE".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .map(|symbol| (symbol.clone(), CoinConfig::for_symbol(&symbol)))
            .collect();

        let master_addresses = coins
            .keys()
            .filter_map(|symbol| {
                std::env::var(format!("MASTER_ADDRESS_{}", symbol))
                    .ok()
                    .filter(|a| !a.trim().is_empty())
                    .map(|address| (symbol.clone(), address))
            })
            .collect();

        Self {
            api_key: std::env::var("NOWNODES_API_KEY").unwrap_or_default(),
            connection_pool_size: std::env::var("CONNECTION_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            max_reconnect_attempts: std::env::var("MAX_RECONNECT_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
            webhook_url: std::env::var("TRANSACTION_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            coins,
            master_addresses,
        }
    }

    pub fn coin(&self, symbol: &str) -> CoinConfig {
        self.coins
            .get(&symbol.to_uppercase())
            .cloned()
            .unwrap_or_else(|| CoinConfig::for_symbol(symbol))
    }

    pub fn master_address(&self, symbol: &str) -> Option<&str> {
        self.master_addresses
            .get(&symbol.to_uppercase())
            .map(String::as_str)
    }
}

/// Timing knobs for the reconnect loop and the pool's connect retries.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub max_reconnect_attempts: u32,
    /// One "second" of the `min(2^n, 30)` reconnect backoff.
    pub backoff_unit: Duration,
    pub max_backoff_units: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            backoff_unit: Duration::from_secs(1),
            max_backoff_units: 30,
        }
    }
}

impl MonitorSettings {
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Delay before reconnect attempt `attempt`: `min(2^attempt, 30)` units.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let units = 2u64
            .checked_pow(attempt)
            .unwrap_or(u64::MAX)
            .min(self.max_backoff_units);
        self.backoff_unit * units as u32
    }
}
