// core/node-client/src/lib.rs
// Connection pool and remote node access shared by monitors and collectors

pub mod client;
pub mod pool;

pub use client::{
    AddressInfo, ClientStats, NodeApi, NodeClient, NodeError, PrivateKey, SignedTx, TxInput, Utxo,
};
pub use pool::{
    ConnectionPool, FrameResponder, PoolError, PoolSettings, PoolStats, WsConnection, WsOptions,
    USER_AGENT,
};
