//! Remote command execution control plane.
//!
//! A command submitted here runs through a layered security pipeline,
//! lands in a persisted lifecycle state machine, and is delivered to a
//! registered beacon over a push channel or a poll checkin. Results are
//! correlated back asynchronously; background sweeps keep beacon health
//! and command timeouts honest.

pub mod beacons;
pub mod configuration;
pub mod controller;
pub mod dispatch;
pub mod error_handling;
pub mod security;
pub mod storage;
