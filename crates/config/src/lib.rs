use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod defaults;
pub mod parser;
pub mod substitution;
pub mod validator;

pub use defaults::*;
pub use parser::*;
pub use substitution::*;
pub use validator::*;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceSection {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            description: String::new(),
            version: default_version(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(rename = "connection_timeout_seconds")]
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
}

impl PostgresConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherBackend {
    #[default]
    Memory,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherConfig {
    #[serde(default)]
    pub backend: PublisherBackend,
    /// Base URL of the message bus HTTP bridge
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_publish_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            backend: PublisherBackend::default(),
            endpoint: None,
            topic: default_topic(),
            timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl PublisherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifierConfig {
    #[serde(default = "default_notifier_buffer")]
    pub buffer: usize,
    #[serde(default = "default_reread_attempts")]
    pub reread_attempts: u32,
    #[serde(default = "default_reread_backoff_ms")]
    pub reread_backoff_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            buffer: default_notifier_buffer(),
            reread_attempts: default_reread_attempts(),
            reread_backoff_ms: default_reread_backoff_ms(),
        }
    }
}

impl NotifierConfig {
    pub fn reread_backoff(&self) -> Duration {
        Duration::from_millis(self.reread_backoff_ms)
    }
}

/// Amount a holding moves by when an order closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldingQuantityConfig {
    #[default]
    OrderShares,
    NegotiatedShares,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SettlementConfig {
    #[serde(default)]
    pub holding_quantity: HoldingQuantityConfig,
    #[serde(default = "default_allow_negative_holdings")]
    pub allow_negative_holdings: bool,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            holding_quantity: HoldingQuantityConfig::default(),
            allow_negative_holdings: default_allow_negative_holdings(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            metrics: None,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub notifier: Option<NotifierConfig>,
    #[serde(default)]
    pub settlement: Option<SettlementConfig>,
    #[serde(default)]
    pub observability: Option<ObservabilityConfig>,
}

impl ServiceConfig {
    pub fn notifier_or_default(&self) -> NotifierConfig {
        self.notifier.clone().unwrap_or_default()
    }

    pub fn settlement_or_default(&self) -> SettlementConfig {
        self.settlement.clone().unwrap_or_default()
    }

    pub fn observability_or_default(&self) -> ObservabilityConfig {
        self.observability.clone().unwrap_or_default()
    }

    /// Port to expose Prometheus metrics on, if enabled
    pub fn metrics_port(&self) -> Option<u16> {
        self.observability
            .as_ref()
            .and_then(|o| o.metrics.as_ref())
            .filter(|m| m.enabled)
            .map(|m| m.port)
    }
}
