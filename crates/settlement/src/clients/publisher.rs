//! Trade publisher - trait and implementations

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, SettlementError};
use crate::types::TradeIntent;

/// Topic trade intents are published on unless configured otherwise
pub const DEFAULT_TOPIC: &str = "input";

/// Client trait for the message bus - protocol agnostic
#[async_trait]
pub trait TradePublisher: Send + Sync {
    /// Hand a trade intent to the matching system
    ///
    /// Delivery is best effort. The engine never waits on this from a
    /// caller's request path.
    async fn publish(&self, intent: &TradeIntent) -> Result<()>;
}

// ==================== In-Memory Implementation ====================

/// Publisher that keeps intents in memory (development, tests, simulation)
pub struct InMemoryTradePublisher {
    published: Mutex<Vec<TradeIntent>>,
    fail: bool,
}

impl InMemoryTradePublisher {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// Make every publish fail
    pub fn with_failure(mut self, fail: bool) -> Self {
        self.fail = fail;
        self
    }

    /// Get every intent published so far
    pub fn published(&self) -> Vec<TradeIntent> {
        self.published.lock().clone()
    }

    /// Get the order IDs of published intents
    pub fn published_orders(&self) -> Vec<Uuid> {
        self.published.lock().iter().map(|i| i.order_id).collect()
    }

    /// Wait until at least `count` intents have been published
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.published.lock().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl Default for InMemoryTradePublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradePublisher for InMemoryTradePublisher {
    async fn publish(&self, intent: &TradeIntent) -> Result<()> {
        if self.fail {
            return Err(SettlementError::Publish("publisher configured to fail".to_string()));
        }

        self.published.lock().push(intent.clone());

        tracing::debug!(order_id = %intent.order_id, "In-memory publisher: recorded trade intent");

        Ok(())
    }
}

// ==================== HTTP Implementation ====================

#[cfg(feature = "client")]
pub mod http {
    use async_trait::async_trait;
    use reqwest::Client;
    use std::time::Duration;

    use super::{TradePublisher, DEFAULT_TOPIC};
    use crate::error::{Result, SettlementError};
    use crate::types::TradeIntent;

    /// Publisher that POSTs intents to a message bus HTTP bridge
    pub struct HttpTradePublisher {
        client: Client,
        endpoint: String,
        topic: String,
    }

    impl HttpTradePublisher {
        /// Create a publisher for `{endpoint}/topics/{topic}`
        pub fn new(endpoint: &str, topic: Option<&str>, timeout: Duration) -> Result<Self> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| SettlementError::Publish(e.to_string()))?;

            Ok(Self {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
                topic: topic.unwrap_or(DEFAULT_TOPIC).to_string(),
            })
        }

        pub fn url(&self) -> String {
            format!("{}/topics/{}", self.endpoint, self.topic)
        }
    }

    #[async_trait]
    impl TradePublisher for HttpTradePublisher {
        async fn publish(&self, intent: &TradeIntent) -> Result<()> {
            let response = self
                .client
                .post(self.url())
                .json(intent)
                .send()
                .await
                .map_err(|e| SettlementError::Publish(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response.text().await.unwrap_or_default();
                return Err(SettlementError::Publish(format!("{}: {}", status, error_text)));
            }

            tracing::debug!(order_id = %intent.order_id, topic = %self.topic, "Published trade intent");

            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_topic_url() {
            let publisher =
                HttpTradePublisher::new("http://bus:8080/", None, Duration::from_secs(1)).unwrap();
            assert_eq!(publisher.url(), "http://bus:8080/topics/input");
        }
    }
}
