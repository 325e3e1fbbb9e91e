//! Command-line surface for the meshbus binary.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "meshbus",
    about = "Message-mesh broker with session-group routing",
    version
)]
pub struct Cli {
    /// Path to the TOML configuration file. Falls back to MESHBUS_CONFIG,
    /// then to built-in defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker until interrupted.
    Start,
    /// Parse and validate the configuration, then exit.
    CheckConfig,
}

impl Cli {
    pub fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => Config::load(path),
            None => Config::load_from_env(),
        }
    }
}

/// Install the global tracing subscriber. RUST_LOG wins over the configured
/// filter when set.
pub fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_no_subcommand() {
        let cli = Cli::parse_from(["meshbus"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parses_check_config_with_path() {
        let cli = Cli::parse_from(["meshbus", "check-config", "--config", "/tmp/m.toml"]);
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
        assert_eq!(cli.config.unwrap(), PathBuf::from("/tmp/m.toml"));
    }

    #[test]
    fn test_load_config_without_path_uses_defaults() {
        let cli = Cli::parse_from(["meshbus", "start"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.session.expired_ms, 60_000);
    }
}
