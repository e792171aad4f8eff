//! Command dispatch: lifecycle state machine, targeting, result
//! correlation, and the approval workflow.

pub mod correlator;
pub mod service;
pub mod types;

pub use correlator::ResultCorrelator;
pub use service::DispatchService;
pub use types::{Command, CommandStatus, DispatchRequest, ExecutionResult, Target};
