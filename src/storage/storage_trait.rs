//! Storage Trait
//!
//! This module defines the `Store` trait, the uniform persistence API for
//! beacons, commands, and security patterns.
//!
//! Implementors are responsible for:
//! - Persisting and retrieving beacon registrations and their liveness fields
//! - Persisting command rows and enforcing compare-and-set state transitions
//! - Managing the tenant-scoped security pattern sets
//!
//! Every state-machine write is conditioned on the expected prior state and
//! reports through its return value whether it won the race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::beacons::types::{BeaconRegistration, HealthStatus};
use crate::dispatch::types::{Command, CommandOutcome};
use crate::error_handling::types::StorageError;
use crate::security::types::SecurityPattern;

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts or updates a beacon registration.
    async fn save_beacon(&self, beacon: &BeaconRegistration) -> Result<(), StorageError>;

    async fn get_beacon(&self, id: Uuid) -> Result<Option<BeaconRegistration>, StorageError>;

    async fn list_beacons(&self, tenant_id: &str) -> Result<Vec<BeaconRegistration>, StorageError>;

    async fn list_all_beacons(&self) -> Result<Vec<BeaconRegistration>, StorageError>;

    /// Refreshes a beacon's last-checkin timestamp.
    async fn record_checkin(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Writes the persisted health status.
    ///
    /// When `expected` is set the write only lands if the current value
    /// matches; returns whether a row was updated.
    async fn update_health(
        &self,
        id: Uuid,
        health: HealthStatus,
        expected: Option<HealthStatus>,
    ) -> Result<bool, StorageError>;

    async fn set_disabled(&self, id: Uuid, disabled: bool) -> Result<(), StorageError>;

    /// Inserts or updates a command row.
    async fn save_command(&self, command: &Command) -> Result<(), StorageError>;

    async fn get_command(&self, id: Uuid) -> Result<Option<Command>, StorageError>;

    /// `queued -> sent`, refused for blocked or approval-pending rows.
    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Applies result fields and transitions to completed or failed.
    ///
    /// Only lands while the row is still queued or sent, so a result can
    /// never resurrect a force-timed-out command.
    async fn apply_result(
        &self,
        id: Uuid,
        outcome: &CommandOutcome,
    ) -> Result<bool, StorageError>;

    /// Flags a row whose caller stopped waiting; the lifecycle state is
    /// left untouched so a late result still applies.
    async fn mark_wait_expired(&self, id: Uuid) -> Result<(), StorageError>;

    async fn set_delivery_failed(&self, id: Uuid, failed: bool) -> Result<(), StorageError>;

    /// Records an approval decision while the row is still gated and
    /// unsent. A denial fails the command terminally.
    async fn record_approval(
        &self,
        id: Uuid,
        approved: bool,
        decided_by: &str,
        reason: Option<&str>,
    ) -> Result<bool, StorageError>;

    /// Deliverable queued rows for one beacon, oldest first.
    async fn pending_for_beacon(&self, beacon_id: Uuid) -> Result<Vec<Command>, StorageError>;

    /// Force-closes overdue rows: sent rows whose execution budget has
    /// elapsed, and deliverable queued rows nothing ever picked up.
    /// Blocked and approval-pending rows are never touched. Returns the
    /// ids that were transitioned.
    async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StorageError>;

    /// Deletes terminal rows of one beacon completed before the cutoff.
    async fn purge_expired(
        &self,
        beacon_id: Uuid,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError>;

    async fn save_pattern(&self, pattern: &SecurityPattern) -> Result<(), StorageError>;

    /// The active pattern set for a tenant: system defaults minus the
    /// tenant's deactivations, plus the tenant's own active rows.
    async fn active_patterns(&self, tenant_id: &str)
        -> Result<Vec<SecurityPattern>, StorageError>;

    /// Deactivates a system-default pattern for one tenant without
    /// touching the shared row.
    async fn deactivate_default(
        &self,
        tenant_id: &str,
        pattern_id: Uuid,
    ) -> Result<(), StorageError>;
}
