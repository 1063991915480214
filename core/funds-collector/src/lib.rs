// core/funds-collector/src/lib.rs
// One-shot sweeps of confirmed balances to a custodial master address

pub mod collector;

pub use collector::{
    CollectionError, CollectionReceipt, CollectionResponse, CollectorStats, Eligibility,
    FundsCollector,
};
