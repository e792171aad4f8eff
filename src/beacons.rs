//! Beacon registration, liveness, and connection handling.
//!
//! Components:
//! - `types`: registration record, health taxonomy, per-beacon policy.
//! - `messages`: the line-delimited JSON channel contract.
//! - `registry`: registration, credential verification, poll checkins.
//! - `connection_manager`: live channel map plus the heartbeat and
//!   reconciliation sweeps.
//! - `listener`: the TCP accept loop for push-mode beacons.

pub mod connection_manager;
pub mod listener;
pub mod messages;
pub mod registry;
pub mod types;

pub use connection_manager::ConnectionManager;
pub use registry::BeaconRegistry;
pub use types::{BeaconRegistration, HealthStatus};
