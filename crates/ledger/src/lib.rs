//! Ledger storage for OrderLedger
//!
//! This crate owns the durable records the settlement engine works on:
//! orders and their fill transactions, assets and their daily price
//! history, and wallet holdings.
//!
//! # Features
//!
//! - Versioned records with guarded (compare-and-swap) writes
//! - Multi-record units of work via [`LedgerTransaction`]
//! - Per-wallet change feed of order inserts and updates
//!
//! # Feature Flags
//!
//! - `postgres` - Enable PostgreSQL storage

pub mod error;
pub mod feed;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use error::{LedgerError, Result};
pub use feed::{ChangeEvent, ChangeFeed, OperationType};
pub use types::{
    Asset, AssetDaily, AssetSummary, Order, OrderDetails, OrderStatus, OrderType, Transaction,
    WalletAsset,
};

// Store exports
pub use store::memory::InMemoryLedgerStore;
pub use store::traits::{LedgerStore, LedgerTransaction, OrderUpdate};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresLedgerStore;
