//! PostgreSQL ledger store implementation
//!
//! Units of work run inside a `sqlx` transaction. Guarded writes are a
//! single `UPDATE ... WHERE version = $n RETURNING`, so the version check
//! and the write happen atomically in the database.
//!
//! The change feed uses `LISTEN/NOTIFY`. `pg_notify` is issued inside the
//! writing transaction, which means PostgreSQL only delivers it once the
//! transaction commits. Each wallet gets its own channel, so filtering by
//! owner happens on the server.
//!
//! Expected tables:
//!
//! ```sql
//! CREATE TABLE orders (
//!     id UUID PRIMARY KEY, wallet_id TEXT NOT NULL, asset_id TEXT NOT NULL REFERENCES assets(id),
//!     shares BIGINT NOT NULL, partial BIGINT NOT NULL, price DOUBLE PRECISION NOT NULL,
//!     type TEXT NOT NULL, status TEXT NOT NULL, version BIGINT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL, updated_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE transactions (
//!     id UUID PRIMARY KEY, order_id UUID NOT NULL REFERENCES orders(id),
//!     broker_transaction_id TEXT NOT NULL, related_investor_id TEXT NOT NULL,
//!     shares BIGINT NOT NULL, price DOUBLE PRECISION NOT NULL, created_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE assets (
//!     id TEXT PRIMARY KEY, symbol TEXT NOT NULL, price DOUBLE PRECISION NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE asset_daily (
//!     id UUID PRIMARY KEY, asset_id TEXT NOT NULL REFERENCES assets(id),
//!     date TIMESTAMPTZ NOT NULL, price DOUBLE PRECISION NOT NULL
//! );
//! CREATE TABLE wallet_assets (
//!     wallet_id TEXT NOT NULL, asset_id TEXT NOT NULL REFERENCES assets(id),
//!     shares BIGINT NOT NULL, version BIGINT NOT NULL,
//!     PRIMARY KEY (wallet_id, asset_id)
//! );
//! ```

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::store::traits::{LedgerStore, LedgerTransaction, OrderUpdate};
use crate::types::{
    Asset, AssetDaily, AssetSummary, Order, OrderDetails, OrderStatus, OrderType, Transaction,
    WalletAsset,
};

/// PostgreSQL identifiers (and so NOTIFY channels) are capped at 63 bytes
const MAX_CHANNEL_LEN: usize = 63;

const CHANNEL_PREFIX: &str = "order_changes_";

/// NOTIFY channel carrying order changes for one wallet
///
/// Wallet ids too long for an identifier are folded into a name-based
/// UUID, so every process derives the same channel for the same wallet.
/// Listeners still filter on `wallet_id` since distinct wallets may share
/// a folded channel.
pub fn order_channel(wallet_id: &str) -> String {
    if CHANNEL_PREFIX.len() + wallet_id.len() <= MAX_CHANNEL_LEN {
        return format!("{}{}", CHANNEL_PREFIX, wallet_id);
    }

    let folded = Uuid::new_v5(&Uuid::NAMESPACE_OID, wallet_id.as_bytes());
    format!("{}{}", CHANNEL_PREFIX, folded.simple())
}

/// PostgreSQL ledger store
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    /// Create a store from an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a new pool to `database_url`
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| LedgerError::Connection(format!("Failed to connect to database: {}", e)))?;

        info!(max_connections, "Connected to PostgreSQL ledger");

        Ok(Self::new(pool))
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, wallet_id, asset_id, shares, partial, price,
                type, status, version, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(order.id)
        .bind(&order.wallet_id)
        .bind(&order.asset_id)
        .bind(order.shares)
        .bind(order.partial)
        .bind(order.price)
        .bind(order.order_type.as_str())
        .bind(order.status.as_str())
        .bind(order.version)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match LedgerError::from(e) {
            LedgerError::Conflict(msg) => LedgerError::Duplicate(msg),
            other => other,
        })?;

        notify(&mut tx, &ChangeEvent::insert(order)).await?;
        tx.commit().await?;

        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&*self.pool)
            .await?;

        row.as_ref().map(row_to_order).transpose()
    }

    async fn list_orders(&self, wallet_id: &str) -> Result<Vec<OrderDetails>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE wallet_id = $1 ORDER BY updated_at DESC")
            .bind(wallet_id)
            .fetch_all(&*self.pool)
            .await?;

        let orders: Vec<Order> = rows.iter().map(row_to_order).collect::<Result<_>>()?;
        if orders.is_empty() {
            return Ok(Vec::new());
        }

        let order_ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let asset_ids: Vec<String> = orders.iter().map(|o| o.asset_id.clone()).collect();

        let transaction_rows = sqlx::query(
            "SELECT * FROM transactions WHERE order_id = ANY($1) ORDER BY created_at ASC",
        )
        .bind(&order_ids)
        .fetch_all(&*self.pool)
        .await?;

        let mut transactions: HashMap<Uuid, Vec<Transaction>> = HashMap::new();
        for row in &transaction_rows {
            let transaction = row_to_transaction(row)?;
            transactions
                .entry(transaction.order_id)
                .or_default()
                .push(transaction);
        }

        let asset_rows = sqlx::query("SELECT id, symbol FROM assets WHERE id = ANY($1)")
            .bind(&asset_ids)
            .fetch_all(&*self.pool)
            .await?;

        let mut assets: HashMap<String, AssetSummary> = HashMap::new();
        for row in &asset_rows {
            let summary = AssetSummary {
                id: row.try_get("id")?,
                symbol: row.try_get("symbol")?,
            };
            assets.insert(summary.id.clone(), summary);
        }

        Ok(orders
            .into_iter()
            .map(|order| OrderDetails {
                transactions: transactions.remove(&order.id).unwrap_or_default(),
                asset: assets.get(&order.asset_id).cloned(),
                order,
            })
            .collect())
    }

    async fn order_transactions(&self, order_id: Uuid) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE order_id = $1 ORDER BY created_at ASC",
        )
        .bind(order_id)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(row_to_transaction).collect()
    }

    async fn upsert_asset(&self, asset: &Asset) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assets (id, symbol, price, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                symbol = EXCLUDED.symbol,
                price = EXCLUDED.price,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&asset.id)
        .bind(&asset.symbol)
        .bind(asset.price)
        .bind(asset.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn get_asset(&self, asset_id: &str) -> Result<Option<Asset>> {
        let row = sqlx::query("SELECT * FROM assets WHERE id = $1")
            .bind(asset_id)
            .fetch_optional(&*self.pool)
            .await?;

        row.as_ref().map(row_to_asset).transpose()
    }

    async fn asset_history(&self, asset_id: &str) -> Result<Vec<AssetDaily>> {
        let rows = sqlx::query("SELECT * FROM asset_daily WHERE asset_id = $1 ORDER BY date ASC")
            .bind(asset_id)
            .fetch_all(&*self.pool)
            .await?;

        rows.iter().map(row_to_asset_daily).collect()
    }

    async fn get_wallet_asset(
        &self,
        wallet_id: &str,
        asset_id: &str,
    ) -> Result<Option<WalletAsset>> {
        let row = sqlx::query("SELECT * FROM wallet_assets WHERE wallet_id = $1 AND asset_id = $2")
            .bind(wallet_id)
            .bind(asset_id)
            .fetch_optional(&*self.pool)
            .await?;

        row.as_ref().map(row_to_wallet_asset).transpose()
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError::Transaction(e.to_string()))?;

        Ok(Box::new(PostgresLedgerTransaction {
            tx,
            changes: Vec::new(),
        }))
    }

    async fn watch_orders(&self, wallet_id: &str) -> Result<ChangeFeed> {
        let channel = order_channel(wallet_id);

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| LedgerError::Connection(e.to_string()))?;
        listener.listen(&channel).await?;

        debug!(channel = %channel, "Listening for order changes");

        let wallet_id = wallet_id.to_string();
        let feed = stream::unfold(Some(listener), move |state| {
            let wallet_id = wallet_id.clone();
            async move {
                let mut listener = state?;
                loop {
                    let notification = match listener.recv().await {
                        Ok(notification) => notification,
                        Err(e) => {
                            warn!(error = %e, "Change listener failed, closing feed");
                            return Some((Err(LedgerError::Connection(e.to_string())), None));
                        }
                    };

                    match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                        Ok(event) if event.wallet_id != wallet_id => continue,
                        Ok(event) => return Some((Ok(event), Some(listener))),
                        Err(e) => return Some((Err(LedgerError::from(e)), Some(listener))),
                    }
                }
            }
        });

        Ok(feed.boxed())
    }
}

/// Unit of work backed by a PostgreSQL transaction
pub struct PostgresLedgerTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    /// Order changes to announce when the transaction commits
    changes: Vec<ChangeEvent>,
}

#[async_trait]
impl LedgerTransaction for PostgresLedgerTransaction {
    async fn get_order(&mut self, order_id: Uuid) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(row_to_order).transpose()
    }

    async fn update_order(&mut self, update: OrderUpdate) -> Result<Order> {
        let row = sqlx::query(
            r#"
            UPDATE orders SET
                partial = $1,
                status = $2,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $3 AND version = $4
            RETURNING *
            "#,
        )
        .bind(update.partial)
        .bind(update.status.as_str())
        .bind(update.order_id)
        .bind(update.expected_version)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => {
                let order = row_to_order(&row)?;
                self.changes.push(ChangeEvent::update(&order));
                Ok(order)
            }
            None => {
                let found: Option<i64> = sqlx::query_scalar("SELECT version FROM orders WHERE id = $1")
                    .bind(update.order_id)
                    .fetch_optional(&mut *self.tx)
                    .await?;

                match found {
                    None => Err(LedgerError::not_found(format!("order {}", update.order_id))),
                    Some(version) => Err(LedgerError::conflict(format!(
                        "order {} expected version {}, found {}",
                        update.order_id, update.expected_version, version
                    ))),
                }
            }
        }
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, order_id, broker_transaction_id, related_investor_id,
                shares, price, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.order_id)
        .bind(&transaction.broker_transaction_id)
        .bind(&transaction.related_investor_id)
        .bind(transaction.shares)
        .bind(transaction.price)
        .bind(transaction.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn set_asset_price(&mut self, asset_id: &str, price: f64) -> Result<()> {
        let result = sqlx::query("UPDATE assets SET price = $1, updated_at = NOW() WHERE id = $2")
            .bind(price)
            .bind(asset_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found(format!("asset {}", asset_id)));
        }
        Ok(())
    }

    async fn insert_asset_daily(&mut self, daily: &AssetDaily) -> Result<()> {
        sqlx::query("INSERT INTO asset_daily (id, asset_id, date, price) VALUES ($1, $2, $3, $4)")
            .bind(daily.id)
            .bind(&daily.asset_id)
            .bind(daily.date)
            .bind(daily.price)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn get_wallet_asset(
        &mut self,
        wallet_id: &str,
        asset_id: &str,
    ) -> Result<Option<WalletAsset>> {
        let row = sqlx::query("SELECT * FROM wallet_assets WHERE wallet_id = $1 AND asset_id = $2")
            .bind(wallet_id)
            .bind(asset_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(row_to_wallet_asset).transpose()
    }

    async fn update_wallet_asset(
        &mut self,
        wallet_id: &str,
        asset_id: &str,
        shares: i64,
        expected_version: i64,
    ) -> Result<WalletAsset> {
        let row = sqlx::query(
            r#"
            UPDATE wallet_assets SET
                shares = $1,
                version = version + 1
            WHERE wallet_id = $2 AND asset_id = $3 AND version = $4
            RETURNING *
            "#,
        )
        .bind(shares)
        .bind(wallet_id)
        .bind(asset_id)
        .bind(expected_version)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => row_to_wallet_asset(&row),
            None => {
                let found: Option<i64> = sqlx::query_scalar(
                    "SELECT version FROM wallet_assets WHERE wallet_id = $1 AND asset_id = $2",
                )
                .bind(wallet_id)
                .bind(asset_id)
                .fetch_optional(&mut *self.tx)
                .await?;

                match found {
                    None => Err(LedgerError::not_found(format!(
                        "wallet asset ({}, {})",
                        wallet_id, asset_id
                    ))),
                    Some(version) => Err(LedgerError::conflict(format!(
                        "wallet asset ({}, {}) expected version {}, found {}",
                        wallet_id, asset_id, expected_version, version
                    ))),
                }
            }
        }
    }

    async fn insert_wallet_asset(&mut self, holding: &WalletAsset) -> Result<()> {
        sqlx::query(
            "INSERT INTO wallet_assets (wallet_id, asset_id, shares, version) VALUES ($1, $2, $3, $4)",
        )
        .bind(&holding.wallet_id)
        .bind(&holding.asset_id)
        .bind(holding.shares)
        .bind(holding.version)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PostgresLedgerTransaction { mut tx, changes } = *self;

        for change in &changes {
            notify(&mut tx, change).await?;
        }

        tx.commit()
            .await
            .map_err(|e| LedgerError::Transaction(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| LedgerError::Transaction(e.to_string()))
    }
}

/// Queue a change notification, delivered by PostgreSQL on commit
async fn notify(tx: &mut sqlx::Transaction<'static, Postgres>, change: &ChangeEvent) -> Result<()> {
    let channel = order_channel(&change.wallet_id);
    let payload = serde_json::to_string(change)?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

fn row_to_order(row: &PgRow) -> Result<Order> {
    let order_type: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;

    Ok(Order {
        id: row.try_get("id")?,
        wallet_id: row.try_get("wallet_id")?,
        asset_id: row.try_get("asset_id")?,
        shares: row.try_get("shares")?,
        partial: row.try_get("partial")?,
        price: row.try_get("price")?,
        order_type: OrderType::parse(&order_type).ok_or_else(|| {
            LedgerError::Serialization(format!("unknown order type '{}'", order_type))
        })?,
        status: OrderStatus::parse(&status).ok_or_else(|| {
            LedgerError::Serialization(format!("unknown order status '{}'", status))
        })?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_transaction(row: &PgRow) -> Result<Transaction> {
    Ok(Transaction {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        broker_transaction_id: row.try_get("broker_transaction_id")?,
        related_investor_id: row.try_get("related_investor_id")?,
        shares: row.try_get("shares")?,
        price: row.try_get("price")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_asset(row: &PgRow) -> Result<Asset> {
    Ok(Asset {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        price: row.try_get("price")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_asset_daily(row: &PgRow) -> Result<AssetDaily> {
    Ok(AssetDaily {
        id: row.try_get("id")?,
        asset_id: row.try_get("asset_id")?,
        date: row.try_get("date")?,
        price: row.try_get("price")?,
    })
}

fn row_to_wallet_asset(row: &PgRow) -> Result<WalletAsset> {
    Ok(WalletAsset {
        wallet_id: row.try_get("wallet_id")?,
        asset_id: row.try_get("asset_id")?,
        shares: row.try_get("shares")?,
        version: row.try_get("version")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_channel_per_wallet() {
        assert_eq!(order_channel("wallet-1"), "order_changes_wallet-1");

        let longest_plain = "w".repeat(MAX_CHANNEL_LEN - CHANNEL_PREFIX.len());
        assert_eq!(order_channel(&longest_plain), format!("order_changes_{}", longest_plain));
    }

    #[test]
    fn test_long_wallet_ids_fold_into_channel_limit() {
        let wallet = "w".repeat(60);
        let channel = order_channel(&wallet);

        assert!(channel.starts_with(CHANNEL_PREFIX));
        assert!(channel.len() <= MAX_CHANNEL_LEN);
        assert_eq!(channel, order_channel(&wallet));
        assert_ne!(channel, order_channel(&"v".repeat(60)));
    }
}
