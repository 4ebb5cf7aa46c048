//! tracing subscriber setup for OrderLedger processes
//!
//! `RUST_LOG` wins when set. Otherwise [`DEFAULT_DIRECTIVES`] keep the
//! settlement crates at `info` and quiet the database and HTTP clients,
//! whose per-query and per-request spans drown out fill outcomes.

use anyhow::Context;
use std::fmt;
use tracing_subscriber::{fmt as tfmt, prelude::*, EnvFilter, Layer, Registry};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVES: &str = "info,ledger=info,settlement=info,sqlx=warn,reqwest=warn";

/// Log output format, as named in the `observability.log_format` setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line with file and line, for a terminal
    #[default]
    Pretty,
    /// One JSON object per event, for log shipping
    Json,
    /// Single line per event
    Compact,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
            Self::Compact => "compact",
        }
    }

    /// Case-insensitive lookup by config name
    pub fn parse(s: &str) -> Option<Self> {
        [Self::Pretty, Self::Json, Self::Compact]
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the event filter from a `RUST_LOG` value, falling back to the defaults
fn event_filter(rust_log: Option<&str>) -> anyhow::Result<EnvFilter> {
    match rust_log.map(str::trim).filter(|v| !v.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid RUST_LOG directives: {}", directives)),
        None => EnvFilter::try_new(DEFAULT_DIRECTIVES).context("Invalid default log directives"),
    }
}

fn output_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Pretty => tfmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Json => tfmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
        LogFormat::Compact => tfmt::layer().compact().with_target(false).boxed(),
    }
}

/// Install the global subscriber for one process
///
/// Fails if a subscriber is already installed or `RUST_LOG` does not parse.
pub fn init_logging(service_name: &str, format: LogFormat) -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = event_filter(rust_log.as_deref())?;

    tracing_subscriber::registry()
        .with(output_layer(format))
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(
        service = service_name,
        %format,
        filter = rust_log.as_deref().unwrap_or(DEFAULT_DIRECTIVES),
        "Logging initialized"
    );

    Ok(())
}

/// Logging for one-shot commands (`validate`, `init`, `simulate`)
pub fn init_default_logging(service_name: &str) -> anyhow::Result<()> {
    init_logging(service_name, LogFormat::Compact)
}
