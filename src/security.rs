//! Security analysis subsystem.
//!
//! Components:
//! - `types`: risk taxonomy, detection rules, pipeline verdicts.
//! - `defaults`: the seeded system-default pattern set.
//! - `judge`: the pluggable semantic classifier contract and fallback.
//! - `pipeline`: the staged analysis pipeline itself.

pub mod defaults;
pub mod judge;
pub mod pipeline;
pub mod types;

pub use pipeline::AnalysisPipeline;
pub use types::{Decision, Outcome, RiskLevel};
