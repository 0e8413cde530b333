//! Layered configuration for the longitudinal deduplication engine
//! (§6): CLI flags, environment variables, a TOML file, and built-in
//! defaults, in that precedence order.

use std::fs;
use std::path::Path;

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub longitudinal: LongitudinalConfig,
    pub general: GeneralConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LongitudinalConfig {
    pub database_user: String,
    pub database_password: String,
    pub database_host: String,
    pub warehouse_port: u16,
    pub mart_port: u16,
    pub num_workers: u32,
}

impl Default for LongitudinalConfig {
    fn default() -> Self {
        Self {
            database_user: "longitudinal".to_string(),
            database_password: String::new(),
            database_host: "localhost".to_string(),
            warehouse_port: 5432,
            mart_port: 5432,
            num_workers: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub tmp_dir: String,
    pub in_production: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { tmp_dir: "/tmp".to_string(), in_production: false }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum CountdownDirection {
    Forwards,
    Backwards,
}

/// CLI surface for the manager binary (§6).
#[derive(Parser, Debug, Clone)]
#[command(name = "longitudinal-manager")]
#[command(version, about = "Longitudinal deduplication engine for HL7 surveillance feeds")]
pub struct CommandLineArgs {
    /// Warehouse database name
    pub data_warehouse: String,

    /// Mart database name
    pub data_mart: String,

    /// Restrict processing to visits admitted on this day (single-day mode)
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub date: Option<chrono::NaiveDate>,

    /// Advance or retreat the persisted date cursor after a successful run
    #[arg(long, value_enum)]
    pub countdown: Option<CountdownDirection>,

    /// Skip the bookkeeping backfill step
    #[arg(long)]
    pub skip_prep: bool,

    #[arg(long, value_name = "PORT")]
    pub warehouse_port: Option<u16>,

    #[arg(long, value_name = "PORT")]
    pub mart_port: Option<u16>,

    /// Repeatable: -v, -vv, -vvv raise log verbosity
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, value_name = "N")]
    pub workers: Option<u32>,

    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,
}

impl Config {
    /// Load configuration with CLI, environment, and file support.
    ///
    /// Precedence (highest to lowest): CLI flag, environment variable,
    /// config file, built-in default.
    pub fn load(cli_args: &CommandLineArgs) -> Result<Self, ConfigError> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = match config_path {
            Some(path) => Self::from_toml(&path)?,
            None => {
                tracing::warn!("no configuration file found, using defaults");
                Config::default()
            },
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(cli_args);
        config.validate()?;
        Ok(config)
    }

    /// Environment variables, prefixed `LONGITUDINAL_` (§6).
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LONGITUDINAL_DATABASE_USER") {
            self.longitudinal.database_user = v;
        }
        if let Ok(v) = std::env::var("LONGITUDINAL_DATABASE_PASSWORD") {
            self.longitudinal.database_password = v;
        }
        if let Ok(v) = std::env::var("LONGITUDINAL_DATABASE_HOST") {
            self.longitudinal.database_host = v;
        }
        if let Ok(v) = std::env::var("LONGITUDINAL_WAREHOUSE_PORT").ok().and_then(|s| s.parse().ok()) {
            self.longitudinal.warehouse_port = v;
        }
        if let Ok(v) = std::env::var("LONGITUDINAL_MART_PORT").ok().and_then(|s| s.parse().ok()) {
            self.longitudinal.mart_port = v;
        }
        if let Ok(v) = std::env::var("LONGITUDINAL_NUM_WORKERS").ok().and_then(|s| s.parse().ok()) {
            self.longitudinal.num_workers = v;
        }
        if let Ok(v) = std::env::var("LONGITUDINAL_TMP_DIR") {
            self.general.tmp_dir = v;
        }
        if let Ok(v) = std::env::var("LONGITUDINAL_IN_PRODUCTION").ok().and_then(|s| s.parse().ok()) {
            self.general.in_production = v;
        }
    }

    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(port) = args.warehouse_port {
            self.longitudinal.warehouse_port = port;
        }
        if let Some(port) = args.mart_port {
            self.longitudinal.mart_port = port;
        }
        if let Some(workers) = args.workers {
            self.longitudinal.num_workers = workers;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.longitudinal.database_user.is_empty() {
            return Err(ConfigError::MissingValue("longitudinal.database_user"));
        }
        if self.longitudinal.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "longitudinal.num_workers",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.longitudinal.warehouse_port == 0 || self.longitudinal.mart_port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "longitudinal.{warehouse,mart}_port",
                message: "must be a valid TCP port".to_string(),
            });
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let candidates = ["longitudinal.toml", "conf/longitudinal.toml", "./longitudinal.toml"];
        candidates.iter().find(|p| Path::new(p).exists()).map(|p| p.to_string())
    }

    fn from_toml(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_string(), source })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path: path.to_string(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_workers_fails_validation() {
        let mut config = Config::default();
        config.longitudinal.num_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_database_user_fails_validation() {
        let mut config = Config::default();
        config.longitudinal.database_user = String::new();
        assert!(config.validate().is_err());
    }
}
