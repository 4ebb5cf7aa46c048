use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "orderledger")]
#[command(about = "OrderLedger - order settlement against a shared asset ledger")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the settlement service with the given configuration
    Start {
        /// Path to the configuration file
        #[arg(short, long, default_value = "orderledger.yaml", env = "ORDERLEDGER_CONFIG")]
        config: PathBuf,

        /// Log live order events for these wallets until shutdown
        #[arg(long = "watch", value_name = "WALLET_ID")]
        watch: Vec<String>,
    },

    /// Validate configuration without starting the service
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "orderledger.yaml", env = "ORDERLEDGER_CONFIG")]
        config: PathBuf,
    },

    /// Initialize a new configuration file with all defaults
    Init {
        /// Output path for the new configuration file
        #[arg(short, long, default_value = "orderledger.yaml")]
        output: PathBuf,
    },

    /// Run a submit, settle and replay scenario against an in-memory ledger
    Simulate {
        /// Wallet placing the order
        #[arg(long, default_value = "wallet-1")]
        wallet: String,

        /// Asset being bought
        #[arg(long, default_value = "asset-1")]
        asset: String,

        /// Shares requested
        #[arg(long, default_value_t = 100)]
        shares: i64,

        /// Order price
        #[arg(long, default_value_t = 10.0)]
        price: f64,

        /// Price of the closing fill
        #[arg(long, default_value_t = 11.0)]
        fill_price: f64,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_with_watches() {
        let cli = Cli::try_parse_from([
            "orderledger", "start", "--config", "prod.yaml", "--watch", "w1", "--watch", "w2",
        ])
        .unwrap();

        match cli.command {
            Commands::Start { config, watch } => {
                assert_eq!(config, PathBuf::from("prod.yaml"));
                assert_eq!(watch, vec!["w1".to_string(), "w2".to_string()]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::try_parse_from(["orderledger", "simulate"]).unwrap();

        match cli.command {
            Commands::Simulate { shares, price, fill_price, .. } => {
                assert_eq!(shares, 100);
                assert_eq!(price, 10.0);
                assert_eq!(fill_price, 11.0);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
