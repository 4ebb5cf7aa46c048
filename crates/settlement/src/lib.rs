//! Settlement for OrderLedger
//!
//! This crate applies trade decisions to the ledger and tells interested
//! parties about the result.
//!
//! # Features
//!
//! - Order submission with fire-and-forget trade intent publishing
//! - Atomic fill application across orders, assets and wallet holdings
//! - Optimistic concurrency: stale writers get [`SettlementError::Conflict`]
//! - Live per-wallet order event subscriptions
//!
//! # Feature Flags
//!
//! - `client` - Enable the HTTP trade publisher

pub mod clients;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod types;

pub use clients::publisher::{InMemoryTradePublisher, TradePublisher};
pub use engine::SettlementEngine;
pub use error::{Result, SettlementError};
pub use notifier::{ChangeNotifier, OrderSubscription, RereadPolicy};
pub use types::{
    FillReport, FillStatus, HoldingPolicy, HoldingQuantity, OrderEvent, OrderEventKind,
    SubmitOrderRequest, TradeIntent,
};

#[cfg(feature = "client")]
pub use clients::publisher::http::HttpTradePublisher;
