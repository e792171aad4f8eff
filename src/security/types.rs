use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered risk classification assigned to a command by the pipeline.
///
/// Ordering matters: the pipeline only ever moves a command's risk upward,
/// and the approval gate compares against a configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::None => "none",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> RiskLevel {
        match s {
            "low" => RiskLevel::Low,
            "medium" => RiskLevel::Medium,
            "high" => RiskLevel::High,
            "critical" => RiskLevel::Critical,
            _ => RiskLevel::None,
        }
    }
}

/// Kind of detection rule.
///
/// A `Blocked` match rejects the command outright at critical risk; a
/// `HighRisk` match only contributes its risk level and a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Blocked,
    HighRisk,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Blocked => "blocked",
            PatternKind::HighRisk => "high_risk",
        }
    }

    pub fn parse(s: &str) -> PatternKind {
        match s {
            "blocked" => PatternKind::Blocked,
            _ => PatternKind::HighRisk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternCategory {
    Filesystem,
    Permissions,
    Network,
    Package,
    Database,
    Container,
    Security,
    Disk,
    System,
    Other,
}

impl PatternCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternCategory::Filesystem => "filesystem",
            PatternCategory::Permissions => "permissions",
            PatternCategory::Network => "network",
            PatternCategory::Package => "package",
            PatternCategory::Database => "database",
            PatternCategory::Container => "container",
            PatternCategory::Security => "security",
            PatternCategory::Disk => "disk",
            PatternCategory::System => "system",
            PatternCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> PatternCategory {
        match s {
            "filesystem" => PatternCategory::Filesystem,
            "permissions" => PatternCategory::Permissions,
            "network" => PatternCategory::Network,
            "package" => PatternCategory::Package,
            "database" => PatternCategory::Database,
            "container" => PatternCategory::Container,
            "security" => PatternCategory::Security,
            "disk" => PatternCategory::Disk,
            "system" => PatternCategory::System,
            _ => PatternCategory::Other,
        }
    }
}

/// One detection rule, either a shared system default (`tenant_id = None`)
/// or a tenant-owned addition.
///
/// System defaults are immutable; a tenant can deactivate one for itself
/// but never rewrite the shared row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPattern {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    pub pattern: String,
    pub kind: PatternKind,
    pub risk_level: RiskLevel,
    pub description: String,
    pub category: PatternCategory,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl SecurityPattern {
    pub fn is_system_default(&self) -> bool {
        self.tenant_id.is_none()
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allow,
    Block,
    RequireApproval,
}

/// Final verdict of the analysis pipeline for one command text.
#[derive(Debug, Clone)]
pub struct Decision {
    pub outcome: Outcome,
    pub risk_level: RiskLevel,
    pub warnings: Vec<String>,
    pub block_reason: Option<String>,
    /// True when an auto-approve override skipped the approval gate.
    /// Kept distinct from a plain allow so the bypass stays auditable.
    pub auto_approved: bool,
}

impl Decision {
    pub fn block(risk_level: RiskLevel, reason: String, warnings: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Block,
            risk_level,
            warnings,
            block_reason: Some(reason),
            auto_approved: false,
        }
    }
}

/// Refined assessment returned by a semantic judge backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub rationale: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Context handed to the judge alongside the raw command text.
#[derive(Debug, Clone, Default)]
pub struct JudgeContext {
    pub tenant_id: String,
    pub beacon_name: Option<String>,
    pub initiated_by: Option<String>,
    pub agent_id: Option<String>,
}
