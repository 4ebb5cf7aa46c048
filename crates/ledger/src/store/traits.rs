//! LedgerStore and LedgerTransaction trait definitions

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::feed::ChangeFeed;
use crate::types::{
    Asset, AssetDaily, Order, OrderDetails, OrderStatus, Transaction, WalletAsset,
};

/// Guarded write against an order row
///
/// Applied only when the stored version still equals `expected_version`;
/// on success the stored version becomes `expected_version + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub order_id: Uuid,
    pub expected_version: i64,
    pub partial: i64,
    pub status: OrderStatus,
}

/// LedgerStore trait - defines the interface for ledger storage
///
/// This trait allows different storage implementations (in-memory, PostgreSQL, etc.)
/// to be swapped without changing the settlement logic. Multi-record writes
/// go through [`LedgerStore::begin`].
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist a newly submitted order
    ///
    /// Emits an `insert` change for the order's wallet.
    async fn insert_order(&self, order: &Order) -> Result<()>;

    /// Get an order by ID
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>>;

    /// List a wallet's orders with their fills, most recently updated first
    async fn list_orders(&self, wallet_id: &str) -> Result<Vec<OrderDetails>>;

    /// Get the fills recorded against an order, oldest first
    async fn order_transactions(&self, order_id: Uuid) -> Result<Vec<Transaction>>;

    /// Create or replace an asset's reference data
    async fn upsert_asset(&self, asset: &Asset) -> Result<()>;

    /// Get an asset by ID
    async fn get_asset(&self, asset_id: &str) -> Result<Option<Asset>>;

    /// Price history samples for an asset, oldest first
    async fn asset_history(&self, asset_id: &str) -> Result<Vec<AssetDaily>>;

    /// Get a wallet's holding of an asset
    async fn get_wallet_asset(&self, wallet_id: &str, asset_id: &str)
        -> Result<Option<WalletAsset>>;

    /// Open a unit of work spanning orders, assets and holdings
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>>;

    /// Open a change feed of order inserts and updates for one wallet
    ///
    /// Only changes committed after this call returns are delivered.
    async fn watch_orders(&self, wallet_id: &str) -> Result<ChangeFeed>;
}

/// A unit of work against the ledger
///
/// Either every write made through the transaction becomes visible on
/// [`commit`](LedgerTransaction::commit), or none does. Dropping a
/// transaction without committing rolls it back.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Read an order, including writes staged in this transaction
    async fn get_order(&mut self, order_id: Uuid) -> Result<Option<Order>>;

    /// Guarded order write
    ///
    /// # Errors
    /// * `NotFound` - no such order
    /// * `Conflict` - the stored version differs from `expected_version`
    async fn update_order(&mut self, update: OrderUpdate) -> Result<Order>;

    /// Append a fill record
    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()>;

    /// Unconditionally set an asset's last traded price
    ///
    /// # Errors
    /// * `NotFound` - no such asset
    async fn set_asset_price(&mut self, asset_id: &str, price: f64) -> Result<()>;

    /// Append a price history sample
    async fn insert_asset_daily(&mut self, daily: &AssetDaily) -> Result<()>;

    /// Read a holding, including writes staged in this transaction
    async fn get_wallet_asset(
        &mut self,
        wallet_id: &str,
        asset_id: &str,
    ) -> Result<Option<WalletAsset>>;

    /// Guarded holding write, returns the holding at its new version
    ///
    /// # Errors
    /// * `NotFound` - no such holding
    /// * `Conflict` - the stored version differs from `expected_version`
    async fn update_wallet_asset(
        &mut self,
        wallet_id: &str,
        asset_id: &str,
        shares: i64,
        expected_version: i64,
    ) -> Result<WalletAsset>;

    /// Create the first holding for a (wallet, asset) pair
    ///
    /// # Errors
    /// * `Conflict` - the pair was created concurrently
    async fn insert_wallet_asset(&mut self, holding: &WalletAsset) -> Result<()>;

    /// Make every staged write visible atomically
    ///
    /// # Errors
    /// * `Conflict` - a guarded write lost against a concurrent commit
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every staged write
    async fn rollback(self: Box<Self>) -> Result<()>;
}
