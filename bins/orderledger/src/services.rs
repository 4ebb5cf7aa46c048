//! Service wiring: builds the ledger, publisher, engine and notifier from config

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use config::{
    HoldingQuantityConfig, LedgerBackend, PublisherBackend, ServiceConfig, SettlementConfig,
};
use ledger::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};
use observability::SettlementMetrics;
use settlement::{
    ChangeNotifier, HoldingPolicy, HoldingQuantity, HttpTradePublisher, InMemoryTradePublisher,
    RereadPolicy, SettlementEngine, TradePublisher,
};

/// Long-lived components shared by every request and watcher
pub struct Services {
    pub engine: Arc<SettlementEngine>,
    pub notifier: ChangeNotifier,
    postgres: Option<PostgresLedgerStore>,
}

impl Services {
    pub async fn from_config(config: &ServiceConfig) -> Result<Self> {
        let metrics = SettlementMetrics::new(&config.service.name);

        let (store, postgres): (Arc<dyn LedgerStore>, Option<PostgresLedgerStore>) =
            match config.ledger.backend {
                LedgerBackend::Memory => {
                    info!("Using in-memory ledger");
                    (Arc::new(InMemoryLedgerStore::new()), None)
                }
                LedgerBackend::Postgres => {
                    let pg = config
                        .ledger
                        .postgres
                        .as_ref()
                        .context("Ledger backend is 'postgres' but postgres configuration is missing")?;
                    let store = PostgresLedgerStore::connect(
                        &pg.url,
                        pg.max_connections,
                        pg.connection_timeout(),
                    )
                    .await
                    .context("Failed to connect to the ledger database")?;
                    (Arc::new(store.clone()), Some(store))
                }
            };

        let publisher: Arc<dyn TradePublisher> = match config.publisher.backend {
            PublisherBackend::Memory => {
                info!("Using in-memory trade publisher");
                Arc::new(InMemoryTradePublisher::new())
            }
            PublisherBackend::Http => {
                let endpoint = config
                    .publisher
                    .endpoint
                    .as_deref()
                    .context("Publisher backend is 'http' but endpoint is missing")?;
                let publisher = HttpTradePublisher::new(
                    endpoint,
                    Some(&config.publisher.topic),
                    config.publisher.timeout(),
                )
                .context("Failed to build HTTP trade publisher")?;
                info!(url = %publisher.url(), "Using HTTP trade publisher");
                Arc::new(publisher)
            }
        };

        let policy = holding_policy(&config.settlement_or_default());
        let engine = SettlementEngine::new(Arc::clone(&store), publisher)
            .with_policy(policy)
            .with_metrics(metrics.clone());

        let notifier_config = config.notifier_or_default();
        let notifier = ChangeNotifier::new(store)
            .with_buffer(notifier_config.buffer)
            .with_reread(RereadPolicy {
                attempts: notifier_config.reread_attempts,
                backoff: notifier_config.reread_backoff(),
            })
            .with_metrics(metrics);

        info!(?policy, "Settlement engine ready");

        Ok(Self {
            engine: Arc::new(engine),
            notifier,
            postgres,
        })
    }

    /// Release pooled database connections
    pub async fn close(&self) {
        if let Some(ref pg) = self.postgres {
            pg.close().await;
            info!("Ledger database pool closed");
        }
    }
}

fn holding_policy(config: &SettlementConfig) -> HoldingPolicy {
    HoldingPolicy {
        quantity: match config.holding_quantity {
            HoldingQuantityConfig::OrderShares => HoldingQuantity::OrderShares,
            HoldingQuantityConfig::NegotiatedShares => HoldingQuantity::NegotiatedShares,
        },
        allow_negative: config.allow_negative_holdings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holding_policy_mapping() {
        assert_eq!(holding_policy(&SettlementConfig::default()), HoldingPolicy::default());

        let strict = SettlementConfig {
            holding_quantity: HoldingQuantityConfig::NegotiatedShares,
            allow_negative_holdings: false,
        };
        assert_eq!(holding_policy(&strict), HoldingPolicy::strict());
    }

    #[tokio::test]
    async fn test_in_memory_wiring() {
        let services = Services::from_config(&ServiceConfig::default()).await.unwrap();

        assert_eq!(services.engine.policy(), HoldingPolicy::default());
        assert!(services.notifier.subscribe("wallet-1").await.is_ok());
        services.close().await;
    }
}
