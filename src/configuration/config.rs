use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use super::types::{SecurityConfig, ServerConfig, StorageConfig, SweepConfig};
use crate::error_handling::types::ConfigError;

/// Application configuration loaded from a TOML file.
///
/// Every section is optional in the file; missing sections fall back to
/// their defaults so a minimal deployment only has to set what it changes.
///
/// # Fields Overview
///
/// - `server`: bind address and port for the beacon listener
/// - `storage`: SQLite database location
/// - `sweeps`: intervals for the heartbeat, reconciliation and stale-command sweeps
/// - `security`: approval threshold and semantic judge settings
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sweeps: SweepConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::BadAddress(format!(
                "invalid bind address '{}'",
                self.server.bind_address
            )));
        }
        if self.server.port == 0 {
            return Err(ConfigError::NotInRange("server.port must not be 0".into()));
        }
        if self.sweeps.heartbeat_sweep_secs == 0
            || self.sweeps.reconcile_sweep_secs == 0
            || self.sweeps.command_sweep_secs == 0
        {
            return Err(ConfigError::NotInRange(
                "sweep intervals must be at least 1 second".into(),
            ));
        }
        if self.sweeps.heartbeat_timeout_secs <= self.sweeps.heartbeat_sweep_secs {
            return Err(ConfigError::NotInRange(
                "heartbeat_timeout_secs must exceed heartbeat_sweep_secs".into(),
            ));
        }
        if self.sweeps.grace_multiplier == 0 {
            return Err(ConfigError::NotInRange(
                "grace_multiplier must be at least 1".into(),
            ));
        }
        if self.security.judge_timeout_secs >= self.security.default_timeout_secs {
            return Err(ConfigError::NotInRange(
                "judge_timeout_secs must stay below default_timeout_secs".into(),
            ));
        }
        Ok(())
    }
}
