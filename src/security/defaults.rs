//! Built-in system-default detection rules.
//!
//! Seeded once into the pattern store at database creation. These rows are
//! shared across tenants and never mutated in place; a tenant that wants a
//! weaker default deactivates it for itself instead.

use chrono::Utc;
use uuid::Uuid;

use super::types::{PatternCategory, PatternKind, RiskLevel, SecurityPattern};

const BLOCKED: &[(&str, PatternCategory, &str)] = &[
    (
        r"rm\s+(-[a-zA-Z]*[rf][a-zA-Z]*\s+)+(/|/\*)(\s|$)",
        PatternCategory::Filesystem,
        "recursive removal of the filesystem root",
    ),
    (
        r"mkfs(\.\w+)?\s",
        PatternCategory::Disk,
        "filesystem creation wipes the target device",
    ),
    (
        r"dd\s+.*of=/dev/(sd|hd|nvme|vd)",
        PatternCategory::Disk,
        "raw write to a block device",
    ),
    (
        r":\(\)\s*\{\s*:\|:\s*&\s*\}\s*;\s*:",
        PatternCategory::System,
        "fork bomb",
    ),
    (
        r"chmod\s+(-[a-zA-Z]+\s+)*777\s+/(\s|$)",
        PatternCategory::Permissions,
        "world-writable permissions on the filesystem root",
    ),
    (
        r"(curl|wget)\s+[^|;]*\|\s*(ba|z|da)?sh",
        PatternCategory::Network,
        "piping a remote download straight into a shell",
    ),
    (
        r">\s*/dev/(sd|hd|nvme|vd)",
        PatternCategory::Disk,
        "shell redirection onto a block device",
    ),
    (
        r"DROP\s+(DATABASE|SCHEMA)\s",
        PatternCategory::Database,
        "dropping an entire database",
    ),
];

const HIGH_RISK: &[(&str, RiskLevel, PatternCategory, &str)] = &[
    (
        r"rm\s+-[a-zA-Z]*r",
        RiskLevel::High,
        PatternCategory::Filesystem,
        "recursive file removal",
    ),
    (
        r"chmod\s+(-R\s+)?[0-7]*7[0-7]*7",
        RiskLevel::Medium,
        PatternCategory::Permissions,
        "broadly permissive chmod",
    ),
    (
        r"chown\s+-R\s",
        RiskLevel::Medium,
        PatternCategory::Permissions,
        "recursive ownership change",
    ),
    (
        r"\b(shutdown|reboot|poweroff|halt)\b",
        RiskLevel::High,
        PatternCategory::System,
        "host shutdown or reboot",
    ),
    (
        r"iptables\s+(-F|--flush)",
        RiskLevel::High,
        PatternCategory::Network,
        "flushing firewall rules",
    ),
    (
        r"\b(useradd|userdel|usermod)\b",
        RiskLevel::Medium,
        PatternCategory::Security,
        "account modification",
    ),
    (
        r"(apt(-get)?|yum|dnf|apk)\s+(remove|purge|erase)",
        RiskLevel::Medium,
        PatternCategory::Package,
        "package removal",
    ),
    (
        r"docker\s+(rm|rmi|system\s+prune)",
        RiskLevel::Medium,
        PatternCategory::Container,
        "container or image removal",
    ),
    (
        r"systemctl\s+(stop|disable|mask)\s",
        RiskLevel::Medium,
        PatternCategory::System,
        "stopping or disabling a service",
    ),
    (
        r"TRUNCATE\s+TABLE",
        RiskLevel::High,
        PatternCategory::Database,
        "table truncation",
    ),
    (
        r"history\s+-c",
        RiskLevel::Medium,
        PatternCategory::Security,
        "clearing shell history",
    ),
    (
        r"\bnc\s+(-[a-zA-Z]*l|.*-e\s)",
        RiskLevel::High,
        PatternCategory::Network,
        "netcat listener or reverse shell",
    ),
];

/// The full system-default set with fresh row ids, ready for seeding.
pub fn system_default_patterns() -> Vec<SecurityPattern> {
    let now = Utc::now();
    let mut patterns = Vec::with_capacity(BLOCKED.len() + HIGH_RISK.len());
    for (pattern, category, description) in BLOCKED {
        patterns.push(SecurityPattern {
            id: Uuid::new_v4(),
            tenant_id: None,
            pattern: (*pattern).to_string(),
            kind: PatternKind::Blocked,
            risk_level: RiskLevel::Critical,
            description: (*description).to_string(),
            category: *category,
            is_active: true,
            created_at: now,
        });
    }
    for (pattern, risk, category, description) in HIGH_RISK {
        patterns.push(SecurityPattern {
            id: Uuid::new_v4(),
            tenant_id: None,
            pattern: (*pattern).to_string(),
            kind: PatternKind::HighRisk,
            risk_level: *risk,
            description: (*description).to_string(),
            category: *category,
            is_active: true,
            created_at: now,
        });
    }
    patterns
}
