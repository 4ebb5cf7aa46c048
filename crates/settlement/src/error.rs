//! Settlement error types

use ledger::LedgerError;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during settlement operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettlementError {
    /// Malformed submission or fill, never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced order does not exist
    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    /// Asset touched by a closing fill does not exist
    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    /// Other referenced record does not exist
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A guarded write found a newer version; re-read and resubmit
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// Store unavailable or write rejected
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Trade intent could not be delivered
    #[error("Publish failed: {0}")]
    Publish(String),
}

impl SettlementError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the caller should re-read and try again
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::OrderNotFound(_) | Self::AssetNotFound(_) | Self::NotFound(_)
        )
    }

    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::OrderNotFound(_) | Self::AssetNotFound(_) | Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Persistence(_) => "persistence",
            Self::Publish(_) => "publish",
        }
    }
}

impl From<LedgerError> for SettlementError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(msg) => Self::NotFound(msg),
            LedgerError::Conflict(msg) => Self::Conflict(msg),
            LedgerError::InvalidInput(msg) => Self::Validation(msg),
            other => Self::Persistence(other.to_string()),
        }
    }
}

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, SettlementError>;
