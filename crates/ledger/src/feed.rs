//! Change feed types
//!
//! A change feed is a live tail of committed order inserts and updates,
//! already filtered to one owning wallet by the store.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::types::Order;

/// Kind of mutation that produced a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
}

/// Raw change notification emitted by a ledger store after commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened to the order
    pub operation: OperationType,
    /// Order the change refers to
    pub order_id: Uuid,
    /// Owning wallet, used for filtering
    pub wallet_id: String,
    /// Order as written by the change, if the backend ships it
    #[serde(default)]
    pub document: Option<Order>,
}

impl ChangeEvent {
    pub fn insert(order: &Order) -> Self {
        Self {
            operation: OperationType::Insert,
            order_id: order.id,
            wallet_id: order.wallet_id.clone(),
            document: Some(order.clone()),
        }
    }

    pub fn update(order: &Order) -> Self {
        Self {
            operation: OperationType::Update,
            order_id: order.id,
            wallet_id: order.wallet_id.clone(),
            document: Some(order.clone()),
        }
    }
}

/// Live stream of change events for one wallet
///
/// Dropping the stream releases the underlying cursor or listener.
pub type ChangeFeed = BoxStream<'static, Result<ChangeEvent>>;
