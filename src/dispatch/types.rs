use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::security::types::RiskLevel;

/// Lifecycle state of a command.
///
/// `queued -> sent -> {completed | failed | timeout}`. A command the
/// pipeline blocked carries `blocked = true` and never leaves its initial
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Sent,
    Completed,
    Failed,
    Timeout,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "queued",
            CommandStatus::Sent => "sent",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> CommandStatus {
        match s {
            "sent" => CommandStatus::Sent,
            "completed" => CommandStatus::Completed,
            "failed" => CommandStatus::Failed,
            "timeout" => CommandStatus::Timeout,
            _ => CommandStatus::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Timeout
        )
    }
}

/// Approval sub-state, independent of the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    NotRequired,
    Pending,
    Approved,
    Denied,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::NotRequired => "not_required",
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> ApprovalState {
        match s {
            "pending" => ApprovalState::Pending,
            "approved" => ApprovalState::Approved,
            "denied" => ApprovalState::Denied,
            _ => ApprovalState::NotRequired,
        }
    }
}

/// Where a dispatch request should land, resolved once at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Named(Uuid),
    FirstAvailable,
    Broadcast,
}

/// One execution request for one beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub tenant_id: String,
    pub beacon_id: Option<Uuid>,
    /// Shared by every row of one broadcast fan-out.
    pub correlation_id: Option<Uuid>,
    pub script: String,
    pub initiated_by: String,
    pub agent_id: Option<String>,
    pub timeout_seconds: u64,
    pub status: CommandStatus,
    pub approval: ApprovalState,
    pub risk_level: RiskLevel,
    pub security_warnings: Vec<String>,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub requires_approval: bool,
    pub auto_approved: bool,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<i64>,
    pub working_dir: Option<String>,
    pub error: Option<String>,
    pub timed_out: bool,
    pub delivery_failed: bool,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result fields reported by a beacon for one command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub working_dir: Option<String>,
}

/// Inbound request shape of the dispatch entry point.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub script: String,
    pub target: Target,
    pub tenant_id: String,
    pub initiated_by: String,
    pub agent_id: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub wait_for_result: bool,
}

/// Approval decision for a gated command.
#[derive(Debug, Clone)]
pub struct ApprovalDecision {
    pub command_id: Uuid,
    pub approved: bool,
    pub decided_by: String,
    pub reason: Option<String>,
}

/// Caller-facing snapshot of a command's current state.
///
/// Every outcome is expressible through this shape without an error
/// escaping to the caller: "never ran", "ran and failed" and "still
/// running, we gave up waiting" are all distinguishable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub command_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
    pub success: bool,
    pub status: String,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub error: Option<String>,
    pub timed_out: bool,
    pub delivery_failed: bool,
    pub blocked: bool,
    pub blocked_reason: Option<String>,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,
    pub security_warnings: Vec<String>,
    pub auto_approved: bool,
}

impl ExecutionResult {
    pub fn from_command(command: &Command) -> Self {
        Self {
            command_id: Some(command.id),
            correlation_id: command.correlation_id,
            success: command.status == CommandStatus::Completed && !command.timed_out,
            status: command.status.as_str().to_string(),
            exit_code: command.exit_code,
            stdout: command.stdout.clone(),
            stderr: command.stderr.clone(),
            execution_time_ms: command.duration_ms,
            error: command.error.clone(),
            timed_out: command.timed_out,
            delivery_failed: command.delivery_failed,
            blocked: command.blocked,
            blocked_reason: command.blocked_reason.clone(),
            requires_approval: command.requires_approval,
            risk_level: command.risk_level,
            security_warnings: command.security_warnings.clone(),
            auto_approved: command.auto_approved,
        }
    }
}
