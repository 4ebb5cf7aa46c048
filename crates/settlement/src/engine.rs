//! Settlement Engine - order submission and fill application

use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use ledger::{
    AssetDaily, LedgerError, LedgerStore, LedgerTransaction, Order, OrderDetails, OrderStatus,
    OrderType, OrderUpdate, Transaction, WalletAsset,
};
use observability::SettlementMetrics;

use crate::clients::publisher::TradePublisher;
use crate::error::{Result, SettlementError};
use crate::types::{FillReport, HoldingPolicy, HoldingQuantity, SubmitOrderRequest, TradeIntent};

/// Settlement Engine - owns the order lifecycle against the ledger
///
/// The engine never retries. A [`SettlementError::Conflict`] means another
/// writer got there first and the reporter must re-read and resubmit.
pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    publisher: Arc<dyn TradePublisher>,
    policy: HoldingPolicy,
    metrics: SettlementMetrics,
}

impl SettlementEngine {
    /// Create a new SettlementEngine
    pub fn new(store: Arc<dyn LedgerStore>, publisher: Arc<dyn TradePublisher>) -> Self {
        Self {
            store,
            publisher,
            policy: HoldingPolicy::default(),
            metrics: SettlementMetrics::new("settlement"),
        }
    }

    pub fn with_policy(mut self, policy: HoldingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: SettlementMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn policy(&self) -> HoldingPolicy {
        self.policy
    }

    /// Submit a new order
    ///
    /// Flow:
    /// 1. Validate the request
    /// 2. Store the order as PENDING at version 1
    /// 3. Publish the trade intent in the background
    pub async fn submit_order(&self, request: SubmitOrderRequest) -> Result<Order> {
        Self::validate_submission(&request)?;

        let order = Order::new(
            request.wallet_id,
            request.asset_id,
            request.order_type,
            request.shares,
            request.price,
        );
        self.store.insert_order(&order).await?;
        self.metrics.order_submitted();

        info!(
            order_id = %order.id,
            wallet_id = %order.wallet_id,
            asset_id = %order.asset_id,
            order_type = %order.order_type,
            shares = order.shares,
            price = order.price,
            "Order submitted"
        );

        self.emit_trade_intent(TradeIntent::from(&order));

        Ok(order)
    }

    /// Apply a fill reported by the matching system
    ///
    /// Order progress, the fill record and, on closure, the asset price,
    /// its history sample and the wallet holding are written as one unit.
    pub async fn apply_fill(&self, fill: FillReport) -> Result<Order> {
        let _timer = self.metrics.fill_timer();

        let result = self.settle(&fill).await;

        match &result {
            Ok(order) => {
                self.metrics.fill_applied(fill.status.as_str());
                info!(
                    order_id = %order.id,
                    broker_transaction_id = %fill.broker_transaction_id,
                    shares = fill.negotiated_shares,
                    price = fill.price,
                    partial = order.partial,
                    status = %order.status,
                    version = order.version,
                    "Fill applied"
                );
            }
            Err(e) if e.is_conflict() => {
                self.metrics.fill_conflict();
                warn!(order_id = %fill.order_id, error = %e, "Fill lost a version race");
            }
            Err(SettlementError::Persistence(msg)) => {
                self.metrics.fill_failed("persistence");
                error!(order_id = %fill.order_id, error = %msg, "Fill could not be persisted");
            }
            Err(e) => {
                self.metrics.fill_failed(e.reason());
                warn!(order_id = %fill.order_id, error = %e, "Fill rejected");
            }
        }

        result
    }

    /// Get an order by ID
    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        Ok(self.store.get_order(order_id).await?)
    }

    /// List a wallet's orders with their fills, most recently updated first
    pub async fn list_orders(&self, wallet_id: &str) -> Result<Vec<OrderDetails>> {
        if wallet_id.is_empty() {
            return Err(SettlementError::validation("Wallet ID is required"));
        }
        Ok(self.store.list_orders(wallet_id).await?)
    }

    fn emit_trade_intent(&self, intent: TradeIntent) {
        let publisher = Arc::clone(&self.publisher);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&intent).await {
                metrics.publish_failed();
                warn!(order_id = %intent.order_id, error = %e, "Failed to publish trade intent");
            }
        });
    }

    async fn settle(&self, fill: &FillReport) -> Result<Order> {
        Self::validate_fill(fill)?;

        let mut tx = self.store.begin().await?;

        match self.settle_in(tx.as_mut(), fill).await {
            Ok(order) => {
                tx.commit().await?;
                Ok(order)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(order_id = %fill.order_id, error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn settle_in(&self, tx: &mut dyn LedgerTransaction, fill: &FillReport) -> Result<Order> {
        let order = tx
            .get_order(fill.order_id)
            .await?
            .ok_or(SettlementError::OrderNotFound(fill.order_id))?;

        // A reporter working from an older view loses before any rule is checked
        let expected_version = fill.expected_version.unwrap_or(order.version);
        if expected_version != order.version {
            return Err(SettlementError::Conflict(format!(
                "order {} expected version {}, found {}",
                order.id, expected_version, order.version
            )));
        }

        let next_status = OrderStatus::from(fill.status);
        if !order.status.can_transition_to(next_status) {
            return Err(SettlementError::validation(format!(
                "Cannot apply a {} fill to order in {} status",
                fill.status.as_str(),
                order.status
            )));
        }
        if fill.negotiated_shares > order.partial {
            return Err(SettlementError::validation(format!(
                "Fill of {} shares exceeds the {} remaining",
                fill.negotiated_shares, order.partial
            )));
        }

        let updated = tx
            .update_order(OrderUpdate {
                order_id: order.id,
                expected_version,
                partial: order.partial - fill.negotiated_shares,
                status: next_status,
            })
            .await?;

        tx.insert_transaction(&Transaction::new(
            order.id,
            fill.broker_transaction_id.as_str(),
            fill.related_investor_id.as_str(),
            fill.negotiated_shares,
            fill.price,
        ))
        .await?;

        if next_status == OrderStatus::Closed {
            self.close_position(tx, &updated, fill).await?;
        }

        Ok(updated)
    }

    /// Record the closing price and move the wallet holding
    async fn close_position(
        &self,
        tx: &mut dyn LedgerTransaction,
        order: &Order,
        fill: &FillReport,
    ) -> Result<()> {
        tx.set_asset_price(&order.asset_id, fill.price)
            .await
            .map_err(|e| match e {
                LedgerError::NotFound(_) => SettlementError::AssetNotFound(order.asset_id.clone()),
                other => other.into(),
            })?;
        tx.insert_asset_daily(&AssetDaily::now(order.asset_id.as_str(), fill.price))
            .await?;

        let holding = tx.get_wallet_asset(&order.wallet_id, &order.asset_id).await?;

        match holding {
            Some(holding) => {
                let delta = match self.policy.quantity {
                    HoldingQuantity::OrderShares => order.shares,
                    HoldingQuantity::NegotiatedShares => fill.negotiated_shares,
                };
                let shares = match order.order_type {
                    OrderType::Buy => holding.shares.checked_add(delta),
                    OrderType::Sell => holding.shares.checked_sub(delta),
                }
                .ok_or_else(|| SettlementError::validation("Holding size overflow"))?;

                self.check_floor(order, shares)?;

                tx.update_wallet_asset(&order.wallet_id, &order.asset_id, shares, holding.version)
                    .await?;
            }
            None => {
                // A SELL closure on a missing holding would start below zero
                if order.order_type == OrderType::Sell {
                    self.check_floor(order, -fill.negotiated_shares)?;
                }

                tx.insert_wallet_asset(&WalletAsset::new(
                    order.wallet_id.as_str(),
                    order.asset_id.as_str(),
                    fill.negotiated_shares,
                ))
                .await?;
            }
        }

        Ok(())
    }

    fn check_floor(&self, order: &Order, shares: i64) -> Result<()> {
        if shares < 0 && !self.policy.allow_negative {
            return Err(SettlementError::validation(format!(
                "Closing order {} would leave wallet {} holding {} shares of {}",
                order.id, order.wallet_id, shares, order.asset_id
            )));
        }
        Ok(())
    }

    /// Validate basic order parameters
    fn validate_submission(request: &SubmitOrderRequest) -> Result<()> {
        if request.wallet_id.is_empty() {
            return Err(SettlementError::validation("Wallet ID is required"));
        }
        if request.asset_id.is_empty() {
            return Err(SettlementError::validation("Asset ID is required"));
        }
        if request.shares <= 0 {
            return Err(SettlementError::validation("Shares must be greater than 0"));
        }
        if !request.price.is_finite() || request.price <= 0.0 {
            return Err(SettlementError::validation("Price must be greater than 0"));
        }
        Ok(())
    }

    fn validate_fill(fill: &FillReport) -> Result<()> {
        if fill.negotiated_shares <= 0 {
            return Err(SettlementError::validation("Negotiated shares must be greater than 0"));
        }
        if !fill.price.is_finite() || fill.price <= 0.0 {
            return Err(SettlementError::validation("Fill price must be greater than 0"));
        }
        if fill.broker_transaction_id.is_empty() {
            return Err(SettlementError::validation("Broker transaction ID is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::publisher::InMemoryTradePublisher;
    use crate::types::FillStatus;
    use assert_matches::assert_matches;
    use ledger::{Asset, InMemoryLedgerStore};
    use std::time::Duration;

    const WALLET: &str = "wallet-1";
    const ASSET: &str = "asset-1";

    async fn setup() -> (SettlementEngine, Arc<InMemoryLedgerStore>, Arc<InMemoryTradePublisher>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        store.upsert_asset(&Asset::new(ASSET, "A1", 10.0)).await.unwrap();
        let publisher = Arc::new(InMemoryTradePublisher::new());
        let engine = SettlementEngine::new(store.clone(), publisher.clone());
        (engine, store, publisher)
    }

    fn fill(order: &Order, shares: i64, price: f64, status: FillStatus) -> FillReport {
        FillReport::new(order.id, shares, price, status, "btx-1", "wallet-2")
    }

    async fn seed_holding(store: &InMemoryLedgerStore, shares: i64) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_wallet_asset(&WalletAsset::new(WALLET, ASSET, shares))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_order_publishes_intent() {
        let (engine, store, publisher) = setup().await;

        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 100, 10.0))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.partial, 100);
        assert_eq!(order.version, 1);
        assert_eq!(store.get_order(order.id).await.unwrap(), Some(order.clone()));

        assert!(publisher.wait_for(1, Duration::from_secs(1)).await);
        assert_eq!(publisher.published_orders(), vec![order.id]);
    }

    #[tokio::test]
    async fn test_submit_order_validation() {
        let (engine, _, _) = setup().await;

        for request in [
            SubmitOrderRequest::buy(WALLET, ASSET, 0, 10.0),
            SubmitOrderRequest::buy(WALLET, ASSET, -5, 10.0),
            SubmitOrderRequest::buy(WALLET, ASSET, 10, 0.0),
            SubmitOrderRequest::buy(WALLET, ASSET, 10, f64::NAN),
            SubmitOrderRequest::buy("", ASSET, 10, 10.0),
            SubmitOrderRequest::sell(WALLET, "", 10, 10.0),
        ] {
            let result = engine.submit_order(request).await;
            assert_matches!(result, Err(SettlementError::Validation(_)));
        }

        assert!(engine.list_orders(WALLET).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_order_survives_publish_failure() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let publisher = Arc::new(InMemoryTradePublisher::new().with_failure(true));
        let engine = SettlementEngine::new(store.clone(), publisher);

        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 10, 1.0))
            .await
            .unwrap();

        assert!(store.get_order(order.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_partial_fill_keeps_order_open() {
        let (engine, store, _) = setup().await;
        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 100, 10.0))
            .await
            .unwrap();

        let updated = engine
            .apply_fill(fill(&order, 40, 10.5, FillStatus::Open))
            .await
            .unwrap();

        assert_eq!(updated.status, OrderStatus::Open);
        assert_eq!(updated.partial, 60);
        assert_eq!(updated.version, 2);

        let transactions = store.order_transactions(order.id).await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].shares, 40);

        // Nothing settles before closure
        assert_eq!(store.get_asset(ASSET).await.unwrap().unwrap().price, 10.0);
        assert!(store.asset_history(ASSET).await.unwrap().is_empty());
        assert!(store.get_wallet_asset(WALLET, ASSET).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_buy_creates_holding() {
        let (engine, store, _) = setup().await;
        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 100, 10.0))
            .await
            .unwrap();

        let closed = engine
            .apply_fill(fill(&order, 100, 11.0, FillStatus::Closed))
            .await
            .unwrap();

        assert_eq!(closed.status, OrderStatus::Closed);
        assert_eq!(closed.partial, 0);
        assert_eq!(closed.version, 2);

        assert_eq!(store.get_asset(ASSET).await.unwrap().unwrap().price, 11.0);
        let history = store.asset_history(ASSET).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].price, 11.0);

        let holding = store.get_wallet_asset(WALLET, ASSET).await.unwrap().unwrap();
        assert_eq!(holding.shares, 100);
        assert_eq!(holding.version, 1);
    }

    #[tokio::test]
    async fn test_close_moves_existing_holding_by_order_shares() {
        let (engine, store, _) = setup().await;
        seed_holding(&store, 10).await;
        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 100, 10.0))
            .await
            .unwrap();

        let open = engine
            .apply_fill(fill(&order, 40, 10.0, FillStatus::Open))
            .await
            .unwrap();
        engine
            .apply_fill(fill(&open, 60, 12.0, FillStatus::Closed))
            .await
            .unwrap();

        let holding = store.get_wallet_asset(WALLET, ASSET).await.unwrap().unwrap();
        assert_eq!(holding.shares, 110);
        assert_eq!(holding.version, 2);
        assert_eq!(store.order_transactions(order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_negotiated_shares_policy() {
        let (engine, store, _) = setup().await;
        let engine = engine.with_policy(HoldingPolicy {
            quantity: HoldingQuantity::NegotiatedShares,
            allow_negative: true,
        });
        seed_holding(&store, 10).await;
        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 100, 10.0))
            .await
            .unwrap();

        let open = engine
            .apply_fill(fill(&order, 40, 10.0, FillStatus::Open))
            .await
            .unwrap();
        engine
            .apply_fill(fill(&open, 60, 12.0, FillStatus::Closed))
            .await
            .unwrap();

        let holding = store.get_wallet_asset(WALLET, ASSET).await.unwrap().unwrap();
        assert_eq!(holding.shares, 70);
    }

    #[tokio::test]
    async fn test_sell_may_go_negative_by_default() {
        let (engine, store, _) = setup().await;
        seed_holding(&store, 10).await;
        let order = engine
            .submit_order(SubmitOrderRequest::sell(WALLET, ASSET, 50, 10.0))
            .await
            .unwrap();

        engine
            .apply_fill(fill(&order, 50, 9.0, FillStatus::Closed))
            .await
            .unwrap();

        let holding = store.get_wallet_asset(WALLET, ASSET).await.unwrap().unwrap();
        assert_eq!(holding.shares, -40);
        assert_eq!(holding.version, 2);
    }

    #[tokio::test]
    async fn test_strict_policy_rejects_negative_holding() {
        let (engine, store, _) = setup().await;
        let engine = engine.with_policy(HoldingPolicy::strict());
        seed_holding(&store, 10).await;
        let order = engine
            .submit_order(SubmitOrderRequest::sell(WALLET, ASSET, 50, 10.0))
            .await
            .unwrap();

        let result = engine
            .apply_fill(fill(&order, 50, 9.0, FillStatus::Closed))
            .await;
        assert_matches!(result, Err(SettlementError::Validation(_)));

        // The whole unit rolled back
        assert_eq!(store.get_order(order.id).await.unwrap(), Some(order.clone()));
        assert!(store.order_transactions(order.id).await.unwrap().is_empty());
        assert_eq!(store.get_asset(ASSET).await.unwrap().unwrap().price, 10.0);
        assert!(store.asset_history(ASSET).await.unwrap().is_empty());
        assert_eq!(
            store.get_wallet_asset(WALLET, ASSET).await.unwrap().unwrap().shares,
            10
        );
    }

    #[tokio::test]
    async fn test_close_sell_without_holding_creates_it() {
        let (engine, store, _) = setup().await;
        let order = engine
            .submit_order(SubmitOrderRequest::sell(WALLET, ASSET, 5, 10.0))
            .await
            .unwrap();

        let closed = engine
            .apply_fill(fill(&order, 5, 9.5, FillStatus::Closed))
            .await
            .unwrap();
        assert_eq!(closed.status, OrderStatus::Closed);

        // Literal behaviour: the new holding takes the negotiated shares as-is
        let holding = store.get_wallet_asset(WALLET, ASSET).await.unwrap();
        assert_eq!(holding, Some(WalletAsset::new(WALLET, ASSET, 5)));
        assert_eq!(holding.map(|h| h.version), Some(1));
    }

    #[tokio::test]
    async fn test_strict_policy_rejects_sell_without_holding() {
        let (engine, store, _) = setup().await;
        let engine = engine.with_policy(HoldingPolicy::strict());
        let order = engine
            .submit_order(SubmitOrderRequest::sell(WALLET, ASSET, 5, 10.0))
            .await
            .unwrap();

        let result = engine
            .apply_fill(fill(&order, 5, 9.5, FillStatus::Closed))
            .await;
        assert_matches!(result, Err(SettlementError::Validation(_)));

        assert_eq!(store.get_order(order.id).await.unwrap(), Some(order.clone()));
        assert!(store.order_transactions(order.id).await.unwrap().is_empty());
        assert!(store.asset_history(ASSET).await.unwrap().is_empty());
        assert!(store.get_wallet_asset(WALLET, ASSET).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let (engine, store, _) = setup().await;
        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 100, 10.0))
            .await
            .unwrap();
        let current = engine
            .apply_fill(fill(&order, 10, 10.0, FillStatus::Open))
            .await
            .unwrap();

        let result = engine
            .apply_fill(fill(&order, 90, 11.0, FillStatus::Closed).at_version(order.version))
            .await;
        assert_matches!(result, Err(SettlementError::Conflict(_)));

        assert_eq!(store.get_order(order.id).await.unwrap(), Some(current));
        assert_eq!(store.order_transactions(order.id).await.unwrap().len(), 1);
        assert!(store.asset_history(ASSET).await.unwrap().is_empty());
        assert!(store.get_wallet_asset(WALLET, ASSET).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_fills_one_wins() {
        let (engine, store, _) = setup().await;
        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 100, 10.0))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            engine.apply_fill(fill(&order, 30, 10.0, FillStatus::Open).at_version(1)),
            engine.apply_fill(fill(&order, 30, 10.0, FillStatus::Open).at_version(1)),
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(SettlementError::Conflict(_))))
                .count(),
            1
        );

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.partial, 70);
        assert_eq!(stored.version, 2);
        assert_eq!(store.order_transactions(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fill_rules() {
        let (engine, _, _) = setup().await;
        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 10, 10.0))
            .await
            .unwrap();

        let over = engine.apply_fill(fill(&order, 11, 10.0, FillStatus::Open)).await;
        assert_matches!(over, Err(SettlementError::Validation(_)));

        let zero = engine.apply_fill(fill(&order, 0, 10.0, FillStatus::Open)).await;
        assert_matches!(zero, Err(SettlementError::Validation(_)));

        let missing = engine
            .apply_fill(FillReport::new(Uuid::new_v4(), 1, 10.0, FillStatus::Open, "btx", "w"))
            .await;
        assert_matches!(missing, Err(SettlementError::OrderNotFound(_)));

        engine
            .apply_fill(fill(&order, 10, 10.0, FillStatus::Closed))
            .await
            .unwrap();
        let after_close = engine.apply_fill(fill(&order, 1, 10.0, FillStatus::Open)).await;
        assert_matches!(after_close, Err(SettlementError::Validation(_)));
    }

    #[tokio::test]
    async fn test_missing_asset_rolls_back_closure() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = SettlementEngine::new(store.clone(), Arc::new(InMemoryTradePublisher::new()));
        let order = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, "unknown", 5, 1.0))
            .await
            .unwrap();

        let result = engine
            .apply_fill(fill(&order, 5, 1.0, FillStatus::Closed))
            .await;
        assert_matches!(result, Err(SettlementError::AssetNotFound(id)) if id == "unknown");

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, OrderStatus::Pending);
        assert!(store.order_transactions(order.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_orders_includes_fills() {
        let (engine, _, _) = setup().await;
        let first = engine
            .submit_order(SubmitOrderRequest::buy(WALLET, ASSET, 10, 10.0))
            .await
            .unwrap();
        engine
            .submit_order(SubmitOrderRequest::buy("wallet-other", ASSET, 10, 10.0))
            .await
            .unwrap();
        engine
            .apply_fill(fill(&first, 4, 10.0, FillStatus::Open))
            .await
            .unwrap();

        let orders = engine.list_orders(WALLET).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order.id, first.id);
        assert_eq!(orders[0].transactions.len(), 1);
        assert_eq!(orders[0].asset.as_ref().map(|a| a.symbol.as_str()), Some("A1"));
    }
}
