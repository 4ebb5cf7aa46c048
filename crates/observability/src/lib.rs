//! Observability infrastructure for OrderLedger
//!
//! This crate provides:
//! - Structured logging via tracing
//! - Prometheus metrics
//! - Settlement metric helpers
//!
//! # Quick Start
//!
//! ```ignore
//! use observability::{init_logging, LogFormat};
//!
//! // Initialize logging
//! init_logging("orderledger", LogFormat::Pretty)?;
//!
//! // Initialize metrics (optional)
//! observability::metrics::init_metrics(9090)?;
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{init_metrics, FillTimer, SettlementMetrics};
