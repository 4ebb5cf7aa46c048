//! OrderLedger CLI and Service Binary
//!
//! This is the main entry point for the OrderLedger application.
//! It provides commands for initializing, validating and starting the
//! settlement service, plus a self-contained simulation.

mod services;
mod shutdown;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use config::{generate_default_config, load_config, save_config, validate_config};
use observability::{init_default_logging, init_logging, init_metrics, LogFormat};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use ledger::{Asset, InMemoryLedgerStore, LedgerStore};
use settlement::{
    ChangeNotifier, FillReport, FillStatus, InMemoryTradePublisher, OrderSubscription,
    SettlementEngine, SubmitOrderRequest,
};

use crate::services::Services;
use crate::shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Start { config, watch } => start_service(config, watch).await,
        Commands::Validate { config } => {
            init_default_logging("orderledger")?;
            info!("Executing 'validate' command");
            validate_command(config).await
        }
        Commands::Init { output } => {
            init_default_logging("orderledger")?;
            info!("Executing 'init' command");
            init_command(output).await
        }
        Commands::Simulate {
            wallet,
            asset,
            shares,
            price,
            fill_price,
        } => {
            init_default_logging("orderledger")?;
            info!("Executing 'simulate' command");
            simulate_command(wallet, asset, shares, price, fill_price).await
        }
    }
}

async fn start_service(config_path: PathBuf, watch: Vec<String>) -> Result<()> {
    // Logging depends on the config, so load it first
    let config = load_config(&config_path)?;

    let observability = config.observability_or_default();
    let format = LogFormat::parse(&observability.log_format).unwrap_or_default();
    init_logging(&config.service.name, format)?;

    info!(path = ?config_path, "OrderLedger starting...");

    let report = validate_config(&config);

    if !report.warnings.is_empty() {
        warn!("Configuration warnings:");
        for warning in &report.warnings {
            warn!(field = %warning.field, message = %warning.message);
        }
    }

    if !report.is_valid() {
        error!(
            error_count = report.errors.len(),
            "Configuration validation failed"
        );
        for err in &report.errors {
            error!("{}", err);
        }
        anyhow::bail!("Cannot start service due to configuration errors");
    }

    if let Some(port) = config.metrics_port() {
        init_metrics(port)?;
    } else {
        debug!("Metrics exporter disabled");
    }

    let services = Services::from_config(&config).await?;
    let shutdown = Shutdown::on_signal();

    let mut watchers = Vec::with_capacity(watch.len());
    for wallet_id in &watch {
        let subscription = services
            .notifier
            .subscribe(wallet_id)
            .await
            .with_context(|| format!("Failed to watch wallet {}", wallet_id))?;
        watchers.push(tokio::spawn(log_order_events(
            subscription,
            shutdown.watcher_token(),
        )));
    }

    info!(
        service = %config.service.name,
        watched_wallets = watch.len(),
        "OrderLedger ready"
    );

    shutdown.wait().await;

    for watcher in watchers {
        if let Err(e) = watcher.await {
            warn!(error = %e, "Order watcher panicked");
        }
    }

    services.close().await;
    info!("OrderLedger stopped");

    Ok(())
}

async fn log_order_events(
    mut subscription: OrderSubscription,
    token: tokio_util::sync::CancellationToken,
) {
    let wallet_id = subscription.wallet_id().to_string();

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = subscription.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        info!(
            wallet_id = %wallet_id,
            event = ?event.event,
            order_id = %event.data.id,
            status = %event.data.status,
            partial = event.data.partial,
            version = event.data.version,
            "Order event"
        );
    }

    debug!(wallet_id = %wallet_id, "Order watcher stopped");
}

async fn validate_command<P: AsRef<Path>>(config_path: P) -> Result<()> {
    info!(path = ?config_path.as_ref(), "Validating configuration");

    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "Failed to load configuration");
            anyhow::bail!(e);
        }
    };

    let report = validate_config(&config);

    println!("\n=== Configuration Validation Report ===\n");

    if !report.defaults_applied.is_empty() {
        println!("Defaults Applied ({}):", report.defaults_applied.len());
        for default in &report.defaults_applied {
            println!("  [info] {} = {}", default.field, default.value);
        }
        println!();
    }

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] [{}] {}", warning.field, warning.message);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {}", err);
        }
        println!();
        anyhow::bail!("Configuration validation failed");
    }

    println!("[ok] Configuration is valid!");
    println!();
    println!("Service: {}", config.service.name);
    println!("Version: {}", config.service.version);
    println!("Ledger: {:?}", config.ledger.backend);
    println!(
        "Publisher: {:?} (topic '{}')",
        config.publisher.backend, config.publisher.topic
    );

    Ok(())
}

async fn init_command<P: AsRef<Path>>(output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!(?output_path, "Initializing new configuration file");

    let config = generate_default_config();

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    save_config(&config, output_path)?;

    println!("[ok] Configuration file created successfully!");
    println!();
    println!("Location: {:?}", output_path);
    println!();
    println!("Next steps:");
    println!("  1. Set DATABASE_URL and MESSAGE_BUS_URL");
    println!(
        "  2. Run 'orderledger validate --config {:?}' to check configuration",
        output_path
    );
    println!(
        "  3. Run 'orderledger start --config {:?}' to start the service",
        output_path
    );

    Ok(())
}

async fn simulate_command(
    wallet: String,
    asset: String,
    shares: i64,
    price: f64,
    fill_price: f64,
) -> Result<()> {
    let store = Arc::new(InMemoryLedgerStore::new());
    store
        .upsert_asset(&Asset::new(asset.as_str(), asset.to_uppercase(), price))
        .await?;
    let publisher = Arc::new(InMemoryTradePublisher::new());
    let engine = SettlementEngine::new(store.clone(), publisher.clone());
    let notifier = ChangeNotifier::new(store.clone());

    let mut events = notifier.subscribe(&wallet).await?;

    let order = engine
        .submit_order(SubmitOrderRequest::buy(wallet.as_str(), asset.as_str(), shares, price))
        .await?;
    println!("Submitted: {}", serde_json::to_string(&order)?);

    if publisher.wait_for(1, Duration::from_secs(1)).await {
        for intent in publisher.published() {
            println!("Trade intent: {}", serde_json::to_string(&intent)?);
        }
    } else {
        warn!("Trade intent was not published in time");
    }

    let closed = engine
        .apply_fill(FillReport::new(
            order.id,
            shares,
            fill_price,
            FillStatus::Closed,
            "sim-btx-1",
            "sim-counterparty",
        ))
        .await?;
    println!("Closed: {}", serde_json::to_string(&closed)?);

    let replay = engine
        .apply_fill(
            FillReport::new(
                order.id,
                shares,
                fill_price,
                FillStatus::Closed,
                "sim-btx-2",
                "sim-counterparty",
            )
            .at_version(order.version),
        )
        .await;
    match replay {
        Err(e) if e.is_conflict() => println!("Stale replay rejected: {}", e),
        Err(e) => return Err(e.into()),
        Ok(_) => anyhow::bail!("Stale replay was applied"),
    }

    let holding = store.get_wallet_asset(&wallet, &asset).await?;
    let asset_price = store.get_asset(&asset).await?.map(|a| a.price);
    let history = store.asset_history(&asset).await?;
    println!("Holding: {}", serde_json::to_string(&holding)?);
    println!(
        "Asset price: {:?}, history samples: {}",
        asset_price,
        history.len()
    );

    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        println!("Event: {}", serde_json::to_string(&event)?);
    }
    events.cancel();

    Ok(())
}
