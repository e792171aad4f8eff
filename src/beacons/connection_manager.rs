//! Live beacon connection registry and health bookkeeping.
//!
//! The live map is the only purely in-memory structure in the control
//! plane. Everything it claims is re-derivable from the store, and the
//! reconciliation sweep exists to repair drift between the two after a
//! crash, a restart, or a beacon that silently disappears.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

use super::messages::OutboundMessage;
use super::types::{BeaconMode, HealthStatus};
use crate::error_handling::types::{ConnectionError, StorageError};
use crate::storage::storage_trait::Store;

struct BeaconHandle {
    tx: Sender<OutboundMessage>,
    last_heartbeat: DateTime<Utc>,
}

pub struct ConnectionManager {
    live: Mutex<HashMap<Uuid, BeaconHandle>>,
    store: Arc<dyn Store>,
    heartbeat_timeout: Duration,
    grace_multiplier: u32,
}

impl ConnectionManager {
    pub fn new(store: Arc<dyn Store>, heartbeat_timeout_secs: u64, grace_multiplier: u32) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            store,
            heartbeat_timeout: Duration::seconds(heartbeat_timeout_secs as i64),
            grace_multiplier,
        }
    }

    /// Registers a freshly authenticated duplex channel and persists the
    /// beacon as healthy.
    pub async fn register(
        &self,
        beacon_id: Uuid,
        tx: Sender<OutboundMessage>,
    ) -> Result<(), StorageError> {
        let now = Utc::now();
        {
            let mut live = self.live.lock().unwrap();
            live.insert(
                beacon_id,
                BeaconHandle {
                    tx,
                    last_heartbeat: now,
                },
            );
        }
        self.store.record_checkin(beacon_id, now).await?;
        self.store
            .update_health(beacon_id, HealthStatus::Healthy, None)
            .await?;
        info!("beacon {} connected", beacon_id);
        Ok(())
    }

    /// Refreshes the heartbeat timestamp for a live connection.
    pub async fn heartbeat(&self, beacon_id: Uuid) -> Result<(), StorageError> {
        let now = Utc::now();
        {
            let mut live = self.live.lock().unwrap();
            if let Some(handle) = live.get_mut(&beacon_id) {
                handle.last_heartbeat = now;
            }
        }
        self.store.record_checkin(beacon_id, now).await
    }

    pub fn deregister(&self, beacon_id: Uuid) {
        let mut live = self.live.lock().unwrap();
        if live.remove(&beacon_id).is_some() {
            debug!("beacon {} deregistered", beacon_id);
        }
    }

    pub fn is_connected(&self, beacon_id: Uuid) -> bool {
        self.live.lock().unwrap().contains_key(&beacon_id)
    }

    pub fn connected_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Hands a message to the beacon's channel.
    ///
    /// Per-beacon ordering follows from the single mpsc channel behind
    /// each connection.
    pub async fn deliver(
        &self,
        beacon_id: Uuid,
        message: OutboundMessage,
    ) -> Result<(), ConnectionError> {
        let tx = {
            let live = self.live.lock().unwrap();
            match live.get(&beacon_id) {
                Some(handle) => handle.tx.clone(),
                None => return Err(ConnectionError::NotConnected),
            }
        };
        tx.send(message)
            .await
            .map_err(|_| ConnectionError::ChannelFailed)
    }

    /// One heartbeat sweep pass: drop connections whose heartbeat has
    /// expired and persist them offline. Returns the expired beacon ids.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StorageError> {
        let expired: Vec<Uuid> = {
            let mut live = self.live.lock().unwrap();
            let stale: Vec<Uuid> = live
                .iter()
                .filter(|(_, handle)| now - handle.last_heartbeat > self.heartbeat_timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                live.remove(id);
            }
            stale
        };
        for id in &expired {
            warn!("beacon {} heartbeat expired, marking offline", id);
            self.store
                .update_health(*id, HealthStatus::Offline, None)
                .await?;
        }
        Ok(expired)
    }

    /// One reconciliation pass: correct drift between the live map and the
    /// persisted health column.
    ///
    /// A beacon with a live channel is persisted healthy; a beacon without
    /// one has its health recomputed from checkin cadence, which is the
    /// only signal poll-mode beacons ever produce. After this pass no
    /// beacon is simultaneously live-connected and persisted offline.
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<(), StorageError> {
        let beacons = self.store.list_all_beacons().await?;
        for beacon in beacons {
            if beacon.disabled {
                continue;
            }
            let connected = self.is_connected(beacon.id);
            if connected {
                if beacon.health != HealthStatus::Healthy {
                    debug!("repairing beacon {} to healthy (live channel)", beacon.id);
                    self.store
                        .update_health(beacon.id, HealthStatus::Healthy, Some(beacon.health))
                        .await?;
                }
                continue;
            }
            // A push beacon without a channel gets the same cadence-derived
            // treatment: its last_checkin stops advancing once the channel
            // is gone.
            let derived = HealthStatus::derive(
                beacon.last_checkin,
                now,
                self.effective_interval(beacon.mode, beacon.poll_interval_secs),
                self.grace_multiplier,
            );
            if derived != beacon.health {
                debug!(
                    "reconciling beacon {} health {} -> {}",
                    beacon.id,
                    beacon.health.as_str(),
                    derived.as_str()
                );
                self.store
                    .update_health(beacon.id, derived, Some(beacon.health))
                    .await?;
            }
        }
        Ok(())
    }

    fn effective_interval(&self, mode: BeaconMode, poll_interval_secs: u64) -> u64 {
        match mode {
            BeaconMode::Poll => poll_interval_secs,
            // Push beacons heartbeat on the channel cadence, not a poll
            // interval.
            BeaconMode::Push => self.heartbeat_timeout.num_seconds().max(1) as u64,
        }
    }
}
