//! Ledger domain types
//!
//! Records persisted by the ledger. Every mutable record carries a
//! `version` that guarded writes compare against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Buy or sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Buy,
    Sell,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Buy => "BUY",
            OrderType::Sell => "SELL",
        }
    }

    /// Parse from the stored representation (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order lifecycle status
///
/// Transitions only move forward: PENDING -> OPEN -> CLOSED, or
/// PENDING -> CLOSED on a single full fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order stored, trade intent emitted, no fill yet
    #[default]
    Pending,
    /// At least one fill applied, order still working
    Open,
    /// Order closed by its final fill
    Closed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Open => "OPEN",
            OrderStatus::Closed => "CLOSED",
        }
    }

    /// Parse from the stored representation (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::Pending, OrderStatus::Open | OrderStatus::Closed) => true,
            (OrderStatus::Open, OrderStatus::Open | OrderStatus::Closed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Unique order identifier
    pub id: Uuid,
    /// Owning wallet
    pub wallet_id: String,
    /// Asset being traded
    pub asset_id: String,
    /// Total shares requested
    pub shares: i64,
    /// Shares still unfilled
    pub partial: i64,
    /// Limit/reference price
    pub price: f64,
    /// Buy or sell
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Current order status
    pub status: OrderStatus,
    /// Optimistic concurrency counter, starts at 1
    pub version: i64,
    /// Order creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a new PENDING order with nothing filled yet
    pub fn new(
        wallet_id: impl Into<String>,
        asset_id: impl Into<String>,
        order_type: OrderType,
        shares: i64,
        price: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            wallet_id: wallet_id.into(),
            asset_id: asset_id.into(),
            shares,
            partial: shares,
            price,
            order_type,
            status: OrderStatus::Pending,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shares filled so far
    pub fn filled_shares(&self) -> i64 {
        self.shares - self.partial
    }

    pub fn is_closed(&self) -> bool {
        self.status == OrderStatus::Closed
    }
}

/// Fill record appended to an order, never mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier
    pub id: Uuid,
    /// Order this fill belongs to
    pub order_id: Uuid,
    /// Fill reference from the broker
    pub broker_transaction_id: String,
    /// Counterparty wallet
    pub related_investor_id: String,
    /// Shares filled
    pub shares: i64,
    /// Fill price
    pub price: f64,
    /// Record creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        order_id: Uuid,
        broker_transaction_id: impl Into<String>,
        related_investor_id: impl Into<String>,
        shares: i64,
        price: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            broker_transaction_id: broker_transaction_id.into(),
            related_investor_id: related_investor_id.into(),
            shares,
            price,
            created_at: Utc::now(),
        }
    }
}

/// Tradable asset with its last traded price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub symbol: String,
    /// Last traded price
    pub price: f64,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(id: impl Into<String>, symbol: impl Into<String>, price: f64) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            price,
            updated_at: Utc::now(),
        }
    }
}

/// Price history sample, one per closing fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDaily {
    pub id: Uuid,
    pub asset_id: String,
    pub date: DateTime<Utc>,
    pub price: f64,
}

impl AssetDaily {
    /// Sample `price` for `asset_id` at the current time
    pub fn now(asset_id: impl Into<String>, price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            asset_id: asset_id.into(),
            date: Utc::now(),
            price,
        }
    }
}

/// Net holding of one asset in one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAsset {
    pub wallet_id: String,
    pub asset_id: String,
    /// Net shares held; may go negative (see `HoldingPolicy` in the settlement crate)
    pub shares: i64,
    pub version: i64,
}

impl WalletAsset {
    /// First holding for a (wallet, asset) pair
    pub fn new(wallet_id: impl Into<String>, asset_id: impl Into<String>, shares: i64) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            asset_id: asset_id.into(),
            shares,
            version: 1,
        }
    }
}

/// Id and symbol of the asset an order refers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSummary {
    pub id: String,
    pub symbol: String,
}

/// An order together with its fills, as listed for a wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub transactions: Vec<Transaction>,
    pub asset: Option<AssetSummary>,
}
