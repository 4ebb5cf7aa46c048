use crate::*;
use regex::Regex;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Service name is required")]
    MissingServiceName,

    #[error("Invalid version format: {0}. Must be in format X.Y.Z (e.g., 1.0.0)")]
    InvalidVersionFormat(String),

    #[error("Ledger: {message}")]
    InvalidLedger { message: String },

    #[error("Publisher: {message}")]
    InvalidPublisher { message: String },

    #[error("{field} must be a positive integer")]
    InvalidPositiveInteger { field: String },

    #[error("Invalid log format: {0}. Must be one of: pretty, json, compact")]
    InvalidLogFormat(String),

    #[error("Environment variable '{var}' is missing or invalid: {message}")]
    InvalidEnvVar { var: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DefaultApplied {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub defaults_applied: Vec<DefaultApplied>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            defaults_applied: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_default(&mut self, field: &str, value: &str) {
        self.defaults_applied.push(DefaultApplied {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_config(config: &ServiceConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_service(&config.service, &mut report);
    validate_ledger(&config.ledger, &mut report);
    validate_publisher(&config.publisher, &mut report);

    match config.notifier {
        Some(ref notifier) => validate_notifier(notifier, &mut report),
        None => report.add_default("notifier", "buffer=256, reread_attempts=3, reread_backoff_ms=50"),
    }

    match config.settlement {
        Some(ref settlement) => validate_settlement(settlement, &mut report),
        None => {
            report.add_default(
                "settlement",
                "holding_quantity=order_shares, allow_negative_holdings=true",
            );
            warn_literal_holdings(&mut report);
        }
    }

    match config.observability {
        Some(ref observability) => validate_observability(observability, &mut report),
        None => report.add_default("observability", "log_format=pretty, metrics disabled"),
    }

    report
}

fn validate_service(service: &ServiceSection, report: &mut ValidationReport) {
    if service.name.trim().is_empty() {
        report.add_error(ValidationError::MissingServiceName);
    }

    let version_ok = Regex::new(r"^\d+\.\d+\.\d+$")
        .map(|re| re.is_match(&service.version))
        .unwrap_or(false);
    if !version_ok {
        report.add_error(ValidationError::InvalidVersionFormat(service.version.clone()));
    }
}

fn validate_ledger(ledger: &LedgerConfig, report: &mut ValidationReport) {
    match ledger.backend {
        LedgerBackend::Memory => {
            report.add_warning(
                "ledger.backend",
                "In-memory ledger keeps no data across restarts",
            );
            if ledger.postgres.is_some() {
                report.add_warning(
                    "ledger.postgres",
                    "postgres section is ignored while backend is 'memory'",
                );
            }
        }
        LedgerBackend::Postgres => match ledger.postgres {
            Some(ref pg) => validate_postgres_config(pg, report),
            None => report.add_error(ValidationError::InvalidLedger {
                message: "Ledger backend is 'postgres' but postgres configuration is missing"
                    .to_string(),
            }),
        },
    }
}

fn validate_postgres_config(pg: &PostgresConfig, report: &mut ValidationReport) {
    if let Some(var) = first_unresolved_env_var(&pg.url) {
        report.add_error(ValidationError::InvalidEnvVar {
            var,
            message: "postgres url is missing or invalid".to_string(),
        });
    } else {
        match Url::parse(&pg.url) {
            Ok(url) if matches!(url.scheme(), "postgres" | "postgresql") => {}
            Ok(url) => report.add_error(ValidationError::InvalidLedger {
                message: format!(
                    "postgres url scheme must be postgres or postgresql, got '{}'",
                    url.scheme()
                ),
            }),
            Err(e) => report.add_error(ValidationError::InvalidLedger {
                message: format!("postgres url is invalid: {}", e),
            }),
        }
    }

    if pg.max_connections == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "ledger.postgres.max_connections".to_string(),
        });
    }

    if pg.connection_timeout_seconds == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "ledger.postgres.connection_timeout_seconds".to_string(),
        });
    }
}

fn validate_publisher(publisher: &PublisherConfig, report: &mut ValidationReport) {
    if publisher.topic.trim().is_empty() {
        report.add_error(ValidationError::InvalidPublisher {
            message: "topic must not be empty".to_string(),
        });
    }

    match publisher.backend {
        PublisherBackend::Memory => {
            report.add_warning(
                "publisher.backend",
                "Trade intents are only recorded in memory and never reach a matching system",
            );
        }
        PublisherBackend::Http => match publisher.endpoint.as_deref() {
            None | Some("") => report.add_error(ValidationError::InvalidPublisher {
                message: "Publisher backend is 'http' but endpoint is missing".to_string(),
            }),
            Some(endpoint) => {
                if let Some(var) = first_unresolved_env_var(endpoint) {
                    report.add_error(ValidationError::InvalidEnvVar {
                        var,
                        message: "publisher endpoint is missing or invalid".to_string(),
                    });
                } else if let Err(e) = Url::parse(endpoint) {
                    report.add_error(ValidationError::InvalidPublisher {
                        message: format!("endpoint '{}' is invalid: {}", endpoint, e),
                    });
                }
            }
        },
    }

    if publisher.timeout_ms == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "publisher.timeout_ms".to_string(),
        });
    }
}

fn validate_notifier(notifier: &NotifierConfig, report: &mut ValidationReport) {
    if notifier.buffer == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "notifier.buffer".to_string(),
        });
    }

    if notifier.reread_attempts == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "notifier.reread_attempts".to_string(),
        });
    }
}

fn validate_settlement(settlement: &SettlementConfig, report: &mut ValidationReport) {
    if settlement.holding_quantity == HoldingQuantityConfig::OrderShares
        || settlement.allow_negative_holdings
    {
        warn_literal_holdings(report);
    }
}

fn warn_literal_holdings(report: &mut ValidationReport) {
    report.add_warning(
        "settlement",
        "Holdings move by the order's total shares and may go negative; \
         set holding_quantity=negotiated_shares and allow_negative_holdings=false for strict accounting",
    );
}

fn validate_observability(observability: &ObservabilityConfig, report: &mut ValidationReport) {
    let valid_formats = ["pretty", "json", "compact"];
    if !valid_formats.contains(&observability.log_format.to_lowercase().as_str()) {
        report.add_error(ValidationError::InvalidLogFormat(
            observability.log_format.clone(),
        ));
    }

    if let Some(ref metrics) = observability.metrics {
        if metrics.enabled && metrics.port == 0 {
            report.add_error(ValidationError::InvalidPositiveInteger {
                field: "observability.metrics.port".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postgres_config(url: &str) -> ServiceConfig {
        ServiceConfig {
            ledger: LedgerConfig {
                backend: LedgerBackend::Postgres,
                postgres: Some(PostgresConfig {
                    url: url.to_string(),
                    max_connections: 5,
                    connection_timeout_seconds: 5,
                }),
            },
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_minimal_config_is_valid_with_defaults() {
        let report = validate_config(&ServiceConfig::default());

        assert!(report.is_valid(), "unexpected errors: {:?}", report.errors);
        assert!(report.warnings.iter().any(|w| w.field == "ledger.backend"));
        assert!(report.defaults_applied.iter().any(|d| d.field == "notifier"));
    }

    #[test]
    fn test_postgres_requires_section() {
        let mut config = ServiceConfig::default();
        config.ledger.backend = LedgerBackend::Postgres;

        let report = validate_config(&config);

        assert!(matches!(
            report.errors.as_slice(),
            [ValidationError::InvalidLedger { .. }]
        ));
    }

    #[test]
    fn test_postgres_url_checks() {
        assert!(validate_config(&postgres_config("postgres://u:p@db:5432/ledger")).is_valid());

        let unresolved = validate_config(&postgres_config("${DATABASE_URL}"));
        assert!(unresolved.errors.contains(&ValidationError::InvalidEnvVar {
            var: "DATABASE_URL".to_string(),
            message: "postgres url is missing or invalid".to_string(),
        }));

        let wrong_scheme = validate_config(&postgres_config("mysql://db/ledger"));
        assert!(!wrong_scheme.is_valid());
    }

    #[test]
    fn test_http_publisher_requires_endpoint() {
        let mut config = ServiceConfig::default();
        config.publisher.backend = PublisherBackend::Http;
        assert!(!validate_config(&config).is_valid());

        config.publisher.endpoint = Some("http://bus:8080".to_string());
        assert!(validate_config(&config).is_valid());
    }

    #[test]
    fn test_bad_values_reported() {
        let mut config = ServiceConfig::default();
        config.service.version = "v1".to_string();
        config.notifier = Some(NotifierConfig {
            buffer: 0,
            ..NotifierConfig::default()
        });
        config.observability = Some(ObservabilityConfig {
            log_format: "xml".to_string(),
            metrics: None,
        });

        let report = validate_config(&config);

        assert_eq!(report.errors.len(), 3);
        assert!(report
            .errors
            .contains(&ValidationError::InvalidLogFormat("xml".to_string())));
    }

    #[test]
    fn test_strict_settlement_has_no_warning() {
        let mut config = ServiceConfig::default();
        config.settlement = Some(SettlementConfig {
            holding_quantity: HoldingQuantityConfig::NegotiatedShares,
            allow_negative_holdings: false,
        });

        let report = validate_config(&config);

        assert!(!report.warnings.iter().any(|w| w.field == "settlement"));
    }
}
