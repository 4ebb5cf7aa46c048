use crate::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

#[instrument(skip(path))]
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServiceConfig> {
    let path = path.as_ref();
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    debug!("Config file content length: {} bytes", content.len());

    let config = parse_config(&content)?;

    info!("Configuration loaded successfully");
    Ok(config)
}

/// Substitute environment variables into `content` and parse it as YAML
pub fn parse_config(content: &str) -> Result<ServiceConfig> {
    let substituted = substitution::substitute_env_vars(content)?;
    debug!("Environment variable substitution completed");

    serde_yaml::from_str(&substituted).with_context(|| "Failed to parse YAML configuration")
}

#[instrument]
pub fn generate_default_config() -> ServiceConfig {
    use defaults::*;

    ServiceConfig {
        service: ServiceSection {
            name: default_service_name(),
            description: "Order settlement ledger".to_string(),
            version: default_version(),
        },
        ledger: LedgerConfig {
            backend: LedgerBackend::Postgres,
            postgres: Some(PostgresConfig {
                url: "${DATABASE_URL}".to_string(),
                max_connections: default_max_connections(),
                connection_timeout_seconds: default_connection_timeout(),
            }),
        },
        publisher: PublisherConfig {
            backend: PublisherBackend::Http,
            endpoint: Some("${MESSAGE_BUS_URL}".to_string()),
            topic: default_topic(),
            timeout_ms: default_publish_timeout_ms(),
        },
        notifier: Some(NotifierConfig::default()),
        settlement: Some(SettlementConfig::default()),
        observability: Some(ObservabilityConfig {
            log_format: "json".to_string(),
            metrics: Some(MetricsConfig {
                enabled: true,
                port: default_metrics_port(),
            }),
        }),
    }
}

#[instrument]
pub fn save_config<P: AsRef<Path> + std::fmt::Debug>(config: &ServiceConfig, path: P) -> Result<()> {
    let path = path.as_ref();
    info!("Saving configuration to: {:?}", path);

    let yaml = serde_yaml::to_string(config)
        .with_context(|| "Failed to serialize configuration to YAML")?;

    fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    info!("Configuration saved successfully");
    Ok(())
}
