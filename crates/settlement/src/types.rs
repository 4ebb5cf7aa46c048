//! Settlement request, report and event types

use ledger::{OperationType, Order, OrderStatus, OrderType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to open a new order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOrderRequest {
    pub wallet_id: String,
    pub asset_id: String,
    pub shares: i64,
    pub price: f64,
    #[serde(rename = "type")]
    pub order_type: OrderType,
}

impl SubmitOrderRequest {
    pub fn buy(wallet_id: impl Into<String>, asset_id: impl Into<String>, shares: i64, price: f64) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            asset_id: asset_id.into(),
            shares,
            price,
            order_type: OrderType::Buy,
        }
    }

    pub fn sell(wallet_id: impl Into<String>, asset_id: impl Into<String>, shares: i64, price: f64) -> Self {
        Self {
            order_type: OrderType::Sell,
            ..Self::buy(wallet_id, asset_id, shares, price)
        }
    }
}

/// Status a fill report moves its order to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillStatus {
    /// Order keeps working
    Open,
    /// Final fill, settles the position
    Closed,
}

impl FillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillStatus::Open => "OPEN",
            FillStatus::Closed => "CLOSED",
        }
    }
}

impl From<FillStatus> for OrderStatus {
    fn from(status: FillStatus) -> Self {
        match status {
            FillStatus::Open => OrderStatus::Open,
            FillStatus::Closed => OrderStatus::Closed,
        }
    }
}

/// Fill reported by the matching/broker system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillReport {
    pub order_id: Uuid,
    pub negotiated_shares: i64,
    pub price: f64,
    pub status: FillStatus,
    pub broker_transaction_id: String,
    pub related_investor_id: String,
    /// Order version the reporter observed; the engine's own read is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
}

impl FillReport {
    pub fn new(
        order_id: Uuid,
        negotiated_shares: i64,
        price: f64,
        status: FillStatus,
        broker_transaction_id: impl Into<String>,
        related_investor_id: impl Into<String>,
    ) -> Self {
        Self {
            order_id,
            negotiated_shares,
            price,
            status,
            broker_transaction_id: broker_transaction_id.into(),
            related_investor_id: related_investor_id.into(),
            expected_version: None,
        }
    }

    /// Pin the guarded write to a version the reporter read earlier
    pub fn at_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Message handed to the matching system when an order is submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub order_id: Uuid,
    pub investor_id: String,
    pub asset_id: String,
    pub shares: i64,
    pub price: f64,
    pub order_type: OrderType,
}

impl From<&Order> for TradeIntent {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            investor_id: order.wallet_id.clone(),
            asset_id: order.asset_id.clone(),
            shares: order.shares,
            price: order.price,
            order_type: order.order_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderEventKind {
    #[serde(rename = "order-created")]
    Created,
    #[serde(rename = "order-updated")]
    Updated,
}

impl From<OperationType> for OrderEventKind {
    fn from(operation: OperationType) -> Self {
        match operation {
            OperationType::Insert => OrderEventKind::Created,
            OperationType::Update => OrderEventKind::Updated,
        }
    }
}

/// Order state pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub event: OrderEventKind,
    pub data: Order,
}

/// How far an existing holding moves when an order closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldingQuantity {
    /// The order's total requested shares
    #[default]
    OrderShares,
    /// The closing fill's negotiated shares
    NegotiatedShares,
}

/// Rules applied to wallet holdings on order closure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingPolicy {
    #[serde(default)]
    pub quantity: HoldingQuantity,
    /// When false, a SELL closure may not take a holding below zero
    #[serde(default = "default_allow_negative")]
    pub allow_negative: bool,
}

fn default_allow_negative() -> bool {
    true
}

impl Default for HoldingPolicy {
    fn default() -> Self {
        Self {
            quantity: HoldingQuantity::OrderShares,
            allow_negative: default_allow_negative(),
        }
    }
}

impl HoldingPolicy {
    /// Negotiated-share moves with a zero floor
    pub fn strict() -> Self {
        Self {
            quantity: HoldingQuantity::NegotiatedShares,
            allow_negative: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_event_wire_format() {
        let order = Order::new("wallet-1", "asset-1", OrderType::Buy, 10, 1.5);
        let event = OrderEvent {
            event: OperationType::Insert.into(),
            data: order,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "order-created");
        assert_eq!(json["data"]["status"], "PENDING");
    }

    #[test]
    fn test_fill_report_version_is_optional() {
        let json = serde_json::json!({
            "order_id": Uuid::new_v4(),
            "negotiated_shares": 5,
            "price": 11.0,
            "status": "CLOSED",
            "broker_transaction_id": "btx-1",
            "related_investor_id": "wallet-2",
        });

        let report: FillReport = serde_json::from_value(json).unwrap();
        assert_eq!(report.status, FillStatus::Closed);
        assert_eq!(report.expected_version, None);
    }

    #[test]
    fn test_trade_intent_from_order() {
        let order = Order::new("wallet-1", "asset-1", OrderType::Sell, 7, 3.0);
        let intent = TradeIntent::from(&order);

        assert_eq!(intent.order_id, order.id);
        assert_eq!(intent.investor_id, "wallet-1");
        assert_eq!(intent.order_type, OrderType::Sell);
    }

    #[test]
    fn test_holding_policy_defaults() {
        let policy: HoldingPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, HoldingPolicy::default());
        assert_eq!(policy.quantity, HoldingQuantity::OrderShares);
        assert!(policy.allow_negative);
    }
}
