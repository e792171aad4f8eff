//! Semantic judge stage of the analysis pipeline.
//!
//! The judge is a pluggable classifier: the pipeline depends only on the
//! [`SemanticJudge`] trait, never on a concrete backend. An LLM-backed
//! implementation plugs in behind the same contract; [`HeuristicJudge`] is
//! the built-in fallback so the pipeline stays complete without one.

use async_trait::async_trait;

use super::types::{JudgeContext, RiskAssessment, RiskLevel};
use crate::error_handling::types::SecurityError;

/// A pluggable classifier that refines the pattern-derived risk level.
///
/// A verdict can only raise the risk or add warnings; the pipeline never
/// lets it clear a pattern-based block.
#[async_trait]
pub trait SemanticJudge: Send + Sync {
    async fn assess(
        &self,
        command: &str,
        context: &JudgeContext,
    ) -> Result<RiskAssessment, SecurityError>;
}

/// Built-in judge using cheap lexical heuristics.
///
/// Catches a few intent signals the regex rules deliberately stay away
/// from: obfuscated payloads, privilege escalation, writes into sensitive
/// locations.
pub struct HeuristicJudge;

impl HeuristicJudge {
    const SIGNALS: &'static [(&'static str, RiskLevel, &'static str)] = &[
        ("base64 -d", RiskLevel::High, "decodes an obfuscated payload"),
        ("base64 --decode", RiskLevel::High, "decodes an obfuscated payload"),
        ("sudo ", RiskLevel::Medium, "runs with elevated privileges"),
        ("/etc/shadow", RiskLevel::High, "touches the password database"),
        ("/etc/sudoers", RiskLevel::High, "touches sudo configuration"),
        ("authorized_keys", RiskLevel::High, "modifies SSH trust"),
        ("crontab", RiskLevel::Medium, "installs scheduled execution"),
        ("eval ", RiskLevel::Medium, "evaluates dynamic shell code"),
        ("nohup ", RiskLevel::Low, "detaches from the session"),
    ];
}

#[async_trait]
impl SemanticJudge for HeuristicJudge {
    async fn assess(
        &self,
        command: &str,
        _context: &JudgeContext,
    ) -> Result<RiskAssessment, SecurityError> {
        let lowered = command.to_lowercase();
        let mut risk = RiskLevel::None;
        let mut warnings = Vec::new();
        for (needle, level, note) in Self::SIGNALS {
            if lowered.contains(needle) {
                risk = risk.max(*level);
                warnings.push(format!("semantic: command {}", note));
            }
        }
        let rationale = if warnings.is_empty() {
            "no semantic risk signals".to_string()
        } else {
            warnings.join("; ")
        };
        Ok(RiskAssessment {
            risk_level: risk,
            rationale,
            warnings,
        })
    }
}
