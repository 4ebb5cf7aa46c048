//! In-memory ledger store implementation
//!
//! Transactions stage their writes privately and validate every guarded
//! version at commit, under a single short write lock. Nothing is held
//! between a transaction's reads and its commit, so concurrent writers
//! never block each other; the loser of a race gets `Conflict`.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::store::traits::{LedgerStore, LedgerTransaction, OrderUpdate};
use crate::types::{
    Asset, AssetDaily, AssetSummary, Order, OrderDetails, Transaction, WalletAsset,
};

/// Default number of change events buffered per subscriber
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

type HoldingKey = (String, String);

fn holding_key(wallet_id: &str, asset_id: &str) -> HoldingKey {
    (wallet_id.to_string(), asset_id.to_string())
}

#[derive(Default)]
struct Tables {
    orders: HashMap<Uuid, Order>,
    transactions: HashMap<Uuid, Vec<Transaction>>,
    assets: HashMap<String, Asset>,
    asset_daily: HashMap<String, Vec<AssetDaily>>,
    wallet_assets: HashMap<HoldingKey, WalletAsset>,
}

struct Shared {
    tables: RwLock<Tables>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Shared {
    fn publish(&self, event: ChangeEvent) {
        // A send error only means nobody is watching right now
        let _ = self.changes.send(event);
    }
}

/// In-memory ledger store for testing and development
#[derive(Clone)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl InMemoryLedgerStore {
    /// Create a new in-memory ledger store
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// Create a store whose change feed buffers `capacity` events per subscriber
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                changes,
            }),
        }
    }

    /// Push a raw event into the change feed without touching any table
    ///
    /// Useful to replay notifications, or to reproduce a feed that runs
    /// ahead of the tables.
    pub fn publish_change(&self, event: ChangeEvent) {
        self.shared.publish(event);
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        {
            let mut tables = self.shared.tables.write();
            if tables.orders.contains_key(&order.id) {
                return Err(LedgerError::Duplicate(format!("order {}", order.id)));
            }
            tables.orders.insert(order.id, order.clone());
            tables.transactions.insert(order.id, Vec::new());
        }

        self.shared.publish(ChangeEvent::insert(order));
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let tables = self.shared.tables.read();
        Ok(tables.orders.get(&order_id).cloned())
    }

    async fn list_orders(&self, wallet_id: &str) -> Result<Vec<OrderDetails>> {
        let tables = self.shared.tables.read();

        let mut result: Vec<OrderDetails> = tables
            .orders
            .values()
            .filter(|o| o.wallet_id == wallet_id)
            .map(|order| OrderDetails {
                order: order.clone(),
                transactions: tables
                    .transactions
                    .get(&order.id)
                    .cloned()
                    .unwrap_or_default(),
                asset: tables.assets.get(&order.asset_id).map(|a| AssetSummary {
                    id: a.id.clone(),
                    symbol: a.symbol.clone(),
                }),
            })
            .collect();

        // Most recently updated first
        result.sort_by(|a, b| b.order.updated_at.cmp(&a.order.updated_at));

        Ok(result)
    }

    async fn order_transactions(&self, order_id: Uuid) -> Result<Vec<Transaction>> {
        let tables = self.shared.tables.read();
        Ok(tables
            .transactions
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_asset(&self, asset: &Asset) -> Result<()> {
        let mut tables = self.shared.tables.write();
        tables.assets.insert(asset.id.clone(), asset.clone());
        Ok(())
    }

    async fn get_asset(&self, asset_id: &str) -> Result<Option<Asset>> {
        let tables = self.shared.tables.read();
        Ok(tables.assets.get(asset_id).cloned())
    }

    async fn asset_history(&self, asset_id: &str) -> Result<Vec<AssetDaily>> {
        let tables = self.shared.tables.read();
        Ok(tables
            .asset_daily
            .get(asset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_wallet_asset(
        &self,
        wallet_id: &str,
        asset_id: &str,
    ) -> Result<Option<WalletAsset>> {
        let tables = self.shared.tables.read();
        Ok(tables
            .wallet_assets
            .get(&holding_key(wallet_id, asset_id))
            .cloned())
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>> {
        Ok(Box::new(InMemoryLedgerTransaction::new(self.shared.clone())))
    }

    async fn watch_orders(&self, wallet_id: &str) -> Result<ChangeFeed> {
        let receiver = self.shared.changes.subscribe();
        let wallet_id = wallet_id.to_string();

        debug!(wallet_id = %wallet_id, "Opening in-memory change feed");

        let feed = stream::unfold((receiver, wallet_id), |(mut receiver, wallet_id)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.wallet_id == wallet_id => {
                        return Some((Ok(event), (receiver, wallet_id)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        return Some((Err(LedgerError::FeedLagged(skipped)), (receiver, wallet_id)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(feed.boxed())
    }
}

/// Order write staged in a transaction
struct StagedOrder {
    /// Committed version the write was based on
    base_version: i64,
    order: Order,
}

/// Holding write staged in a transaction
struct StagedHolding {
    /// Committed version the write was based on, `None` for a new holding
    base_version: Option<i64>,
    holding: WalletAsset,
}

/// Unit of work against an [`InMemoryLedgerStore`]
pub struct InMemoryLedgerTransaction {
    shared: Arc<Shared>,
    orders: HashMap<Uuid, StagedOrder>,
    transactions: Vec<Transaction>,
    asset_prices: HashMap<String, f64>,
    asset_daily: Vec<AssetDaily>,
    holdings: HashMap<HoldingKey, StagedHolding>,
}

impl InMemoryLedgerTransaction {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            orders: HashMap::new(),
            transactions: Vec::new(),
            asset_prices: HashMap::new(),
            asset_daily: Vec::new(),
            holdings: HashMap::new(),
        }
    }

    fn current_order(&self, order_id: Uuid) -> Option<Order> {
        if let Some(staged) = self.orders.get(&order_id) {
            return Some(staged.order.clone());
        }
        self.shared.tables.read().orders.get(&order_id).cloned()
    }

    fn current_holding(&self, key: &HoldingKey) -> Option<WalletAsset> {
        if let Some(staged) = self.holdings.get(key) {
            return Some(staged.holding.clone());
        }
        self.shared.tables.read().wallet_assets.get(key).cloned()
    }

    fn asset_exists(&self, asset_id: &str) -> bool {
        self.shared.tables.read().assets.contains_key(asset_id)
    }

    /// Check every staged write against committed state
    fn validate(&self, tables: &Tables) -> Result<()> {
        for (order_id, staged) in &self.orders {
            let committed = tables.orders.get(order_id).map(|o| o.version);
            if committed != Some(staged.base_version) {
                return Err(LedgerError::conflict(format!(
                    "order {} expected version {}, found {:?}",
                    order_id, staged.base_version, committed
                )));
            }
        }

        for ((wallet_id, asset_id), staged) in &self.holdings {
            let committed = tables
                .wallet_assets
                .get(&holding_key(wallet_id, asset_id))
                .map(|h| h.version);
            if committed != staged.base_version {
                return Err(LedgerError::conflict(format!(
                    "wallet asset ({}, {}) expected version {:?}, found {:?}",
                    wallet_id, asset_id, staged.base_version, committed
                )));
            }
        }

        for asset_id in self.asset_prices.keys() {
            if !tables.assets.contains_key(asset_id) {
                return Err(LedgerError::not_found(format!("asset {}", asset_id)));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl LedgerTransaction for InMemoryLedgerTransaction {
    async fn get_order(&mut self, order_id: Uuid) -> Result<Option<Order>> {
        Ok(self.current_order(order_id))
    }

    async fn update_order(&mut self, update: OrderUpdate) -> Result<Order> {
        let current = self
            .current_order(update.order_id)
            .ok_or_else(|| LedgerError::not_found(format!("order {}", update.order_id)))?;

        if current.version != update.expected_version {
            return Err(LedgerError::conflict(format!(
                "order {} expected version {}, found {}",
                update.order_id, update.expected_version, current.version
            )));
        }

        let base_version = self
            .orders
            .get(&update.order_id)
            .map(|s| s.base_version)
            .unwrap_or(current.version);

        let order = Order {
            partial: update.partial,
            status: update.status,
            version: current.version + 1,
            updated_at: Utc::now(),
            ..current
        };

        self.orders.insert(
            update.order_id,
            StagedOrder {
                base_version,
                order: order.clone(),
            },
        );

        Ok(order)
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        if self.current_order(transaction.order_id).is_none() {
            return Err(LedgerError::not_found(format!(
                "order {}",
                transaction.order_id
            )));
        }
        self.transactions.push(transaction.clone());
        Ok(())
    }

    async fn set_asset_price(&mut self, asset_id: &str, price: f64) -> Result<()> {
        if !self.asset_exists(asset_id) {
            return Err(LedgerError::not_found(format!("asset {}", asset_id)));
        }
        self.asset_prices.insert(asset_id.to_string(), price);
        Ok(())
    }

    async fn insert_asset_daily(&mut self, daily: &AssetDaily) -> Result<()> {
        if !self.asset_exists(&daily.asset_id) {
            return Err(LedgerError::not_found(format!("asset {}", daily.asset_id)));
        }
        self.asset_daily.push(daily.clone());
        Ok(())
    }

    async fn get_wallet_asset(
        &mut self,
        wallet_id: &str,
        asset_id: &str,
    ) -> Result<Option<WalletAsset>> {
        Ok(self.current_holding(&holding_key(wallet_id, asset_id)))
    }

    async fn update_wallet_asset(
        &mut self,
        wallet_id: &str,
        asset_id: &str,
        shares: i64,
        expected_version: i64,
    ) -> Result<WalletAsset> {
        let key = holding_key(wallet_id, asset_id);
        let current = self.current_holding(&key).ok_or_else(|| {
            LedgerError::not_found(format!("wallet asset ({}, {})", wallet_id, asset_id))
        })?;

        if current.version != expected_version {
            return Err(LedgerError::conflict(format!(
                "wallet asset ({}, {}) expected version {}, found {}",
                wallet_id, asset_id, expected_version, current.version
            )));
        }

        let base_version = match self.holdings.get(&key) {
            Some(staged) => staged.base_version,
            None => Some(current.version),
        };

        let holding = WalletAsset {
            shares,
            version: current.version + 1,
            ..current
        };

        self.holdings.insert(
            key,
            StagedHolding {
                base_version,
                holding: holding.clone(),
            },
        );

        Ok(holding)
    }

    async fn insert_wallet_asset(&mut self, holding: &WalletAsset) -> Result<()> {
        let key = holding_key(&holding.wallet_id, &holding.asset_id);
        if self.current_holding(&key).is_some() {
            return Err(LedgerError::conflict(format!(
                "wallet asset ({}, {}) already exists",
                holding.wallet_id, holding.asset_id
            )));
        }

        self.holdings.insert(
            key,
            StagedHolding {
                base_version: None,
                holding: holding.clone(),
            },
        );
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;

        let events: Vec<ChangeEvent> = {
            let mut tables = this.shared.tables.write();
            this.validate(&tables)?;

            let now = Utc::now();
            let mut events = Vec::with_capacity(this.orders.len());

            for (order_id, staged) in this.orders {
                events.push(ChangeEvent::update(&staged.order));
                tables.orders.insert(order_id, staged.order);
            }

            for transaction in this.transactions {
                tables
                    .transactions
                    .entry(transaction.order_id)
                    .or_default()
                    .push(transaction);
            }

            for (asset_id, price) in this.asset_prices {
                if let Some(asset) = tables.assets.get_mut(&asset_id) {
                    asset.price = price;
                    asset.updated_at = now;
                }
            }

            for daily in this.asset_daily {
                tables
                    .asset_daily
                    .entry(daily.asset_id.clone())
                    .or_default()
                    .push(daily);
            }

            for (key, staged) in this.holdings {
                tables.wallet_assets.insert(key, staged.holding);
            }

            events
        };

        for event in events {
            this.shared.publish(event);
        }

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(
            staged_orders = self.orders.len(),
            staged_holdings = self.holdings.len(),
            "Rolling back in-memory transaction"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::OperationType;
    use crate::types::{OrderStatus, OrderType};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn create_test_order(wallet_id: &str) -> Order {
        Order::new(wallet_id, "asset-1", OrderType::Buy, 100, 10.0)
    }

    fn close_update(order: &Order) -> OrderUpdate {
        OrderUpdate {
            order_id: order.id,
            expected_version: order.version,
            partial: 0,
            status: OrderStatus::Closed,
        }
    }

    async fn next_event(feed: &mut ChangeFeed) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .expect("feed timed out")
            .expect("feed ended")
            .expect("feed error")
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryLedgerStore::new();
        let order = create_test_order("wallet-1");

        store.insert_order(&order).await.unwrap();

        let retrieved = store.get_order(order.id).await.unwrap();
        assert_eq!(retrieved, Some(order.clone()));

        let duplicate = store.insert_order(&order).await;
        assert_matches!(duplicate, Err(LedgerError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_guarded_update_rejects_stale_version() {
        let store = InMemoryLedgerStore::new();
        let order = create_test_order("wallet-1");
        store.insert_order(&order).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut update = close_update(&order);
        update.expected_version = 7;

        let result = tx.update_order(update).await;
        assert_matches!(result, Err(LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let store = InMemoryLedgerStore::new();
        let order = create_test_order("wallet-1");
        store.insert_order(&order).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let updated = tx.update_order(close_update(&order)).await.unwrap();
        assert_eq!(updated.version, 2);

        // Readers outside the transaction still see version 1
        let committed = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(committed.version, 1);

        tx.commit().await.unwrap();

        let committed = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(committed.version, 2);
        assert_eq!(committed.status, OrderStatus::Closed);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = InMemoryLedgerStore::new();
        store
            .upsert_asset(&Asset::new("asset-1", "AST1", 10.0))
            .await
            .unwrap();
        let order = create_test_order("wallet-1");
        store.insert_order(&order).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.update_order(close_update(&order)).await.unwrap();
        tx.set_asset_price("asset-1", 99.0).await.unwrap();
        tx.insert_wallet_asset(&WalletAsset::new("wallet-1", "asset-1", 100))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.get_order(order.id).await.unwrap().unwrap().version, 1);
        assert_eq!(store.get_asset("asset-1").await.unwrap().unwrap().price, 10.0);
        assert!(store
            .get_wallet_asset("wallet-1", "asset-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_commit_loses_race_against_concurrent_writer() {
        let store = InMemoryLedgerStore::new();
        let order = create_test_order("wallet-1");
        store.insert_order(&order).await.unwrap();

        let mut slow = store.begin().await.unwrap();
        slow.update_order(close_update(&order)).await.unwrap();

        let mut fast = store.begin().await.unwrap();
        fast.update_order(OrderUpdate {
            partial: 40,
            status: OrderStatus::Open,
            ..close_update(&order)
        })
        .await
        .unwrap();
        fast.commit().await.unwrap();

        let result = slow.commit().await;
        assert_matches!(result, Err(LedgerError::Conflict(_)));

        let committed = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(committed.version, 2);
        assert_eq!(committed.partial, 40);
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let store = InMemoryLedgerStore::new();
        let order = create_test_order("wallet-1");
        store.insert_order(&order).await.unwrap();

        // Stage an order write and a new holding
        let mut tx = store.begin().await.unwrap();
        tx.update_order(close_update(&order)).await.unwrap();
        tx.insert_transaction(&Transaction::new(order.id, "brk-1", "wallet-2", 100, 11.0))
            .await
            .unwrap();
        tx.insert_wallet_asset(&WalletAsset::new("wallet-1", "asset-1", 100))
            .await
            .unwrap();

        // Another writer creates the same holding first
        let mut other = store.begin().await.unwrap();
        other
            .insert_wallet_asset(&WalletAsset::new("wallet-1", "asset-1", 5))
            .await
            .unwrap();
        other.commit().await.unwrap();

        let result = tx.commit().await;
        assert_matches!(result, Err(LedgerError::Conflict(_)));

        // The order write was discarded along with the holding write
        let committed = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(committed.version, 1);
        assert!(store.order_transactions(order.id).await.unwrap().is_empty());
        assert_eq!(
            store
                .get_wallet_asset("wallet-1", "asset-1")
                .await
                .unwrap()
                .unwrap()
                .shares,
            5
        );
    }

    #[tokio::test]
    async fn test_racing_holding_updates_serialized_by_version() {
        let store = InMemoryLedgerStore::new();
        let mut seed = store.begin().await.unwrap();
        seed.insert_wallet_asset(&WalletAsset::new("wallet-1", "asset-1", 10))
            .await
            .unwrap();
        seed.commit().await.unwrap();

        // Both writers read version 1
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first
            .update_wallet_asset("wallet-1", "asset-1", 20, 1)
            .await
            .unwrap();
        second
            .update_wallet_asset("wallet-1", "asset-1", 30, 1)
            .await
            .unwrap();

        first.commit().await.unwrap();
        let result = second.commit().await;
        assert_matches!(result, Err(LedgerError::Conflict(_)));

        let holding = store
            .get_wallet_asset("wallet-1", "asset-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holding.shares, 20);
        assert_eq!(holding.version, 2);

        // A fresh writer pinned to the stale version is refused up front
        let mut stale = store.begin().await.unwrap();
        let result = stale.update_wallet_asset("wallet-1", "asset-1", 40, 1).await;
        assert_matches!(result, Err(LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_set_asset_price_requires_asset() {
        let store = InMemoryLedgerStore::new();
        let mut tx = store.begin().await.unwrap();

        let result = tx.set_asset_price("missing", 1.0).await;
        assert_matches!(result, Err(LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_watch_orders_filters_by_wallet() {
        let store = InMemoryLedgerStore::new();
        let mut feed = store.watch_orders("wallet-1").await.unwrap();

        let other = create_test_order("wallet-2");
        store.insert_order(&other).await.unwrap();

        let order = create_test_order("wallet-1");
        store.insert_order(&order).await.unwrap();

        let event = next_event(&mut feed).await;
        assert_eq!(event.operation, OperationType::Insert);
        assert_eq!(event.order_id, order.id);

        let mut tx = store.begin().await.unwrap();
        tx.update_order(close_update(&order)).await.unwrap();
        tx.commit().await.unwrap();

        let event = next_event(&mut feed).await;
        assert_eq!(event.operation, OperationType::Update);
        assert_eq!(event.document.map(|o| o.version), Some(2));
    }

    #[tokio::test]
    async fn test_list_orders_most_recent_first() {
        let store = InMemoryLedgerStore::new();
        store
            .upsert_asset(&Asset::new("asset-1", "AST1", 10.0))
            .await
            .unwrap();

        let first = create_test_order("wallet-1");
        store.insert_order(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = create_test_order("wallet-1");
        store.insert_order(&second).await.unwrap();
        store.insert_order(&create_test_order("wallet-2")).await.unwrap();

        let listed = store.list_orders("wallet-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].order.id, second.id);
        assert_eq!(listed[1].order.id, first.id);
        assert_eq!(listed[0].asset.as_ref().map(|a| a.symbol.as_str()), Some("AST1"));
    }
}
