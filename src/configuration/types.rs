use serde::Deserialize;

use crate::security::types::RiskLevel;

/// Network settings for the beacon listener.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 7740,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "balise.sqlite3".to_string(),
        }
    }
}

/// Intervals and thresholds for the two background sweeps.
///
/// `heartbeat_timeout_secs` bounds how long a live connection may stay silent
/// before it is dropped. `grace_multiplier` scales a poll-mode beacon's
/// `poll_interval` when deriving health from checkin cadence.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SweepConfig {
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_sweep_secs: u64,
    pub reconcile_sweep_secs: u64,
    pub command_sweep_secs: u64,
    pub grace_multiplier: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
            heartbeat_sweep_secs: 5,
            reconcile_sweep_secs: 60,
            command_sweep_secs: 10,
            grace_multiplier: 3,
        }
    }
}

/// Security pipeline settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SecurityConfig {
    /// Risk level at or above which a command needs an approval decision.
    pub approval_threshold: RiskLevel,
    /// Whether the semantic judge stage runs at all.
    pub judge_enabled: bool,
    /// Internal budget for one judge call. Must stay below the command
    /// timeout so a slow classifier cannot eat the whole request budget.
    pub judge_timeout_secs: u64,
    /// Timeout applied when a dispatch request does not carry one.
    pub default_timeout_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            approval_threshold: RiskLevel::High,
            judge_enabled: true,
            judge_timeout_secs: 10,
            default_timeout_secs: 60,
        }
    }
}
