//! Change Notifier - live per-wallet order events
//!
//! Each subscription owns a producer task that tails the store's change
//! feed for one wallet, re-reads the authoritative order for every raw
//! change and pushes a typed [`OrderEvent`] into a bounded channel.
//! Cancelling or dropping the subscription stops the task, which drops
//! the feed and with it the store cursor or listener.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ledger::{ChangeEvent, ChangeFeed, LedgerStore, Order};
use observability::SettlementMetrics;

use crate::error::{Result, SettlementError};
use crate::types::OrderEvent;

/// Default number of undelivered events a subscription buffers
pub const DEFAULT_BUFFER: usize = 256;

/// How hard to look for an order the feed announced but the store does not show yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RereadPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RereadPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Change Notifier - hands out order event subscriptions
#[derive(Clone)]
pub struct ChangeNotifier {
    store: Arc<dyn LedgerStore>,
    buffer: usize,
    reread: RereadPolicy,
    metrics: SettlementMetrics,
}

impl ChangeNotifier {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            buffer: DEFAULT_BUFFER,
            reread: RereadPolicy::default(),
            metrics: SettlementMetrics::new("settlement"),
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn with_reread(mut self, reread: RereadPolicy) -> Self {
        self.reread = reread;
        self
    }

    pub fn with_metrics(mut self, metrics: SettlementMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Subscribe to order events for a wallet
    ///
    /// Only changes committed after this returns are delivered.
    pub async fn subscribe(&self, wallet_id: &str) -> Result<OrderSubscription> {
        if wallet_id.is_empty() {
            return Err(SettlementError::validation("Wallet ID is required"));
        }

        let feed = self.store.watch_orders(wallet_id).await?;
        let (sender, receiver) = mpsc::channel(self.buffer);
        let cancel = CancellationToken::new();

        let relay = Relay {
            store: Arc::clone(&self.store),
            reread: self.reread,
            wallet_id: wallet_id.to_string(),
            sender,
            cancel: cancel.clone(),
        };

        self.metrics.subscription_opened();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            relay.run(feed).await;
            metrics.subscription_closed();
        });

        info!(wallet_id, "Order subscription opened");

        Ok(OrderSubscription {
            wallet_id: wallet_id.to_string(),
            receiver,
            cancel,
        })
    }
}

/// Producer side of one subscription
struct Relay {
    store: Arc<dyn LedgerStore>,
    reread: RereadPolicy,
    wallet_id: String,
    sender: mpsc::Sender<OrderEvent>,
    cancel: CancellationToken,
}

impl Relay {
    async fn run(self, mut feed: ChangeFeed) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = feed.next() => next,
            };

            let change: ChangeEvent = match next {
                Some(Ok(change)) => change,
                Some(Err(e)) => {
                    warn!(wallet_id = %self.wallet_id, error = %e, "Change feed error, continuing");
                    continue;
                }
                None => {
                    debug!(wallet_id = %self.wallet_id, "Change feed ended");
                    break;
                }
            };

            debug!(
                wallet_id = %self.wallet_id,
                order_id = %change.order_id,
                operation = ?change.operation,
                "Order change received"
            );

            let Some(order) = self.reread(change.order_id).await else {
                if self.cancel.is_cancelled() {
                    break;
                }
                warn!(
                    wallet_id = %self.wallet_id,
                    order_id = %change.order_id,
                    "Changed order not visible, skipping"
                );
                continue;
            };

            let event = OrderEvent {
                event: change.operation.into(),
                data: order,
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = self.sender.send(event) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        info!(wallet_id = %self.wallet_id, "Order subscription closed");
    }

    /// Read the order as committed, waiting out a feed that runs ahead of the store
    async fn reread(&self, order_id: Uuid) -> Option<Order> {
        for attempt in 1..=self.reread.attempts.max(1) {
            match self.store.get_order(order_id).await {
                Ok(Some(order)) => return Some(order),
                Ok(None) => {}
                Err(e) => {
                    warn!(%order_id, attempt, error = %e, "Order re-read failed");
                }
            }

            if attempt < self.reread.attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(self.reread.backoff) => {}
                }
            }
        }
        None
    }
}

/// Live stream of order events for one wallet
///
/// Ends when the underlying feed ends or the subscription is cancelled.
/// Dropping it cancels.
#[derive(Debug)]
pub struct OrderSubscription {
    wallet_id: String,
    receiver: mpsc::Receiver<OrderEvent>,
    cancel: CancellationToken,
}

impl OrderSubscription {
    /// Wait for the next event, `None` once the subscription is over
    pub async fn recv(&mut self) -> Option<OrderEvent> {
        self.receiver.recv().await
    }

    /// Stop the producer and release the feed
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }
}

impl Stream for OrderSubscription {
    type Item = OrderEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for OrderSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
