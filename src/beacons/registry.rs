//! Beacon registration and checkin handling.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::types::{BeaconMode, BeaconPolicy, BeaconRegistration, HealthStatus};
use crate::dispatch::types::Command;
use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::Store;

/// Parameters for a new registration.
#[derive(Debug, Clone)]
pub struct NewBeacon {
    pub tenant_id: String,
    pub name: String,
    pub mode: BeaconMode,
    pub poll_interval_secs: u64,
    pub policy: BeaconPolicy,
    pub retention_days: Option<u32>,
    pub hostname: Option<String>,
    pub os_info: Option<String>,
}

pub struct BeaconRegistry {
    store: Arc<dyn Store>,
}

impl BeaconRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn hash_token(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    /// Registers a beacon and issues its credential.
    ///
    /// The plaintext token is returned exactly once; only its hash is
    /// persisted. Health starts at `Unknown` until the first checkin.
    pub async fn register(
        &self,
        params: NewBeacon,
    ) -> Result<(BeaconRegistration, String), StorageError> {
        let token = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let beacon = BeaconRegistration {
            id: Uuid::new_v4(),
            tenant_id: params.tenant_id,
            name: params.name,
            credential_hash: Self::hash_token(&token),
            policy: params.policy,
            mode: params.mode,
            poll_interval_secs: params.poll_interval_secs,
            retention_days: params.retention_days,
            last_checkin: None,
            health: HealthStatus::Unknown,
            hostname: params.hostname,
            os_info: params.os_info,
            disabled: false,
            registered_at: Utc::now(),
        };
        self.store.save_beacon(&beacon).await?;
        info!("registered beacon {} ({})", beacon.name, beacon.id);
        Ok((beacon, token))
    }

    /// Verifies a presented credential against the stored hash.
    ///
    /// Returns the registration on success, `None` for unknown ids, bad
    /// tokens, or soft-disabled beacons.
    pub async fn verify(
        &self,
        beacon_id: Uuid,
        token: &str,
    ) -> Result<Option<BeaconRegistration>, StorageError> {
        let beacon = match self.store.get_beacon(beacon_id).await? {
            Some(b) => b,
            None => return Ok(None),
        };
        if beacon.disabled || beacon.credential_hash != Self::hash_token(token) {
            return Ok(None);
        }
        Ok(Some(beacon))
    }

    /// Handles a poll-mode checkin: refreshes liveness and drains queued
    /// commands for the beacon, marking each one sent.
    ///
    /// Rows whose sent CAS fails (raced by another writer) are skipped
    /// rather than handed out twice.
    pub async fn checkin(&self, beacon_id: Uuid) -> Result<Vec<Command>, StorageError> {
        let now = Utc::now();
        self.store.record_checkin(beacon_id, now).await?;
        self.store
            .update_health(beacon_id, HealthStatus::Healthy, None)
            .await?;
        let mut picked_up = Vec::new();
        for command in self.store.pending_for_beacon(beacon_id).await? {
            if self.store.mark_sent(command.id, now).await? {
                picked_up.push(command);
            } else {
                debug!("skipping command {} raced out of queued state", command.id);
            }
        }
        Ok(picked_up)
    }

    /// Soft-disable: the beacon stops authenticating and dispatching but
    /// its row survives while commands still reference it.
    pub async fn set_disabled(&self, beacon_id: Uuid, disabled: bool) -> Result<(), StorageError> {
        self.store.set_disabled(beacon_id, disabled).await
    }
}
