use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a beacon reaches the control plane.
///
/// `Push` beacons hold a long-lived duplex channel; `Poll` beacons check in
/// on a cadence and pick up queued work, so their health can only ever be
/// derived from checkin timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeaconMode {
    Poll,
    Push,
}

impl BeaconMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeaconMode::Poll => "poll",
            BeaconMode::Push => "push",
        }
    }

    pub fn parse(s: &str) -> BeaconMode {
        match s {
            "push" => BeaconMode::Push,
            _ => BeaconMode::Poll,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Offline,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Offline => "offline",
            HealthStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> HealthStatus {
        match s {
            "healthy" => HealthStatus::Healthy,
            "degraded" => HealthStatus::Degraded,
            "offline" => HealthStatus::Offline,
            _ => HealthStatus::Unknown,
        }
    }

    /// Derives health from checkin cadence.
    ///
    /// Pure function of (last checkin, now, poll interval): within one
    /// interval is healthy, within `grace_multiplier` intervals degraded,
    /// beyond that offline. Never seen at all is unknown.
    pub fn derive(
        last_checkin: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        poll_interval_secs: u64,
        grace_multiplier: u32,
    ) -> HealthStatus {
        let last = match last_checkin {
            Some(t) => t,
            None => return HealthStatus::Unknown,
        };
        let elapsed = now - last;
        if elapsed <= Duration::seconds(poll_interval_secs as i64) {
            HealthStatus::Healthy
        } else if elapsed <= Duration::seconds(poll_interval_secs as i64 * grace_multiplier as i64)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Offline
        }
    }
}

/// Execution policy attached to a beacon, consumed by the analysis pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeaconPolicy {
    /// Allowed program names; empty means unrestricted.
    pub allowed_commands: Vec<String>,
    /// Allowed absolute path prefixes; empty means unrestricted.
    pub allowed_paths: Vec<String>,
    /// Explicit, audited override that skips the approval gate.
    pub auto_approve: bool,
}

/// One registered remote executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconRegistration {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    /// SHA-256 hex of the credential issued at registration. The plaintext
    /// token is returned once and never stored.
    pub credential_hash: String,
    pub policy: BeaconPolicy,
    pub mode: BeaconMode,
    pub poll_interval_secs: u64,
    /// Completed command rows older than this are purged; `None` keeps them
    /// forever.
    pub retention_days: Option<u32>,
    pub last_checkin: Option<DateTime<Utc>>,
    pub health: HealthStatus,
    pub hostname: Option<String>,
    pub os_info: Option<String>,
    pub disabled: bool,
    pub registered_at: DateTime<Utc>,
}

impl BeaconRegistration {
    pub fn is_dispatchable(&self) -> bool {
        !self.disabled && self.health == HealthStatus::Healthy
    }
}
