//! Top-level assembly of the control plane.

pub mod controller_handler;

pub use controller_handler::Controller;
