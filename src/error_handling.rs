//! Error types shared across the control plane subsystems.

pub mod types;
