//! Layered security analysis pipeline.
//!
//! Stage order is a cost ladder: the regex pattern match is cheap and always
//! runs first, the beacon policy check is a set lookup, and the semantic
//! judge is expensive and only ever sees inputs that already cleared the
//! pattern stage. A judge verdict can raise the working risk level or add
//! warnings; it can never clear a pattern-based block.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use regex::Regex;
use uuid::Uuid;

use super::judge::SemanticJudge;
use super::types::{Decision, JudgeContext, Outcome, PatternKind, RiskLevel};
use crate::beacons::types::BeaconPolicy;
use crate::error_handling::types::SecurityError;
use crate::storage::storage_trait::Store;

/// Working state after the pattern stage, before the decision is made.
#[derive(Debug, Clone)]
pub struct PatternAnalysis {
    pub risk_level: RiskLevel,
    pub warnings: Vec<String>,
    pub block_reason: Option<String>,
}

pub struct AnalysisPipeline {
    store: Arc<dyn Store>,
    judge: Option<Arc<dyn SemanticJudge>>,
    approval_threshold: RiskLevel,
    judge_timeout: Duration,
    /// Compiled rules keyed by pattern id. A row's pattern text never
    /// changes once stored, so entries stay valid for the process
    /// lifetime.
    regex_cache: Mutex<HashMap<Uuid, Regex>>,
}

impl AnalysisPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        judge: Option<Arc<dyn SemanticJudge>>,
        approval_threshold: RiskLevel,
        judge_timeout: Duration,
    ) -> Self {
        Self {
            store,
            judge,
            approval_threshold,
            judge_timeout,
            regex_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the full pipeline for one command against one beacon policy.
    pub async fn analyze(
        &self,
        command_text: &str,
        tenant_id: &str,
        policy: &BeaconPolicy,
        context: &JudgeContext,
    ) -> Result<Decision, SecurityError> {
        let analysis = self.pattern_stage(command_text, tenant_id).await?;
        if let Some(reason) = analysis.block_reason {
            return Ok(Decision::block(
                RiskLevel::Critical,
                reason,
                analysis.warnings,
            ));
        }
        if let Some(reason) = Self::policy_violation(command_text, policy) {
            return Ok(Decision::block(
                analysis.risk_level,
                reason,
                analysis.warnings,
            ));
        }
        let analysis = self.judge_stage(command_text, context, analysis).await;
        Ok(self.decide(analysis, policy.auto_approve))
    }

    /// Stage 1: evaluate the tenant's active pattern set.
    ///
    /// A `blocked` match short-circuits with a block reason at critical
    /// risk; `high_risk` matches accumulate warnings and the maximum risk
    /// level among them.
    pub async fn pattern_stage(
        &self,
        command_text: &str,
        tenant_id: &str,
    ) -> Result<PatternAnalysis, SecurityError> {
        let patterns = self.store.active_patterns(tenant_id).await?;
        let mut risk_level = RiskLevel::Low;
        let mut warnings = Vec::new();
        for pattern in &patterns {
            let regex = match self.compiled(pattern.id, &pattern.pattern) {
                Some(r) => r,
                None => continue,
            };
            if !regex.is_match(command_text) {
                continue;
            }
            match pattern.kind {
                PatternKind::Blocked => {
                    debug!("blocked pattern {} matched", pattern.id);
                    return Ok(PatternAnalysis {
                        risk_level: RiskLevel::Critical,
                        warnings,
                        block_reason: Some(format!("blocked pattern: {}", pattern.description)),
                    });
                }
                PatternKind::HighRisk => {
                    risk_level = risk_level.max(pattern.risk_level);
                    warnings.push(format!(
                        "{} risk ({}): {}",
                        pattern.risk_level.as_str(),
                        pattern.category.as_str(),
                        pattern.description
                    ));
                }
            }
        }
        Ok(PatternAnalysis {
            risk_level,
            warnings,
            block_reason: None,
        })
    }

    /// Compiles and caches a rule, or returns the cached compilation.
    /// Unparseable patterns are skipped with a warning.
    fn compiled(&self, pattern_id: Uuid, pattern: &str) -> Option<Regex> {
        let mut cache = self.regex_cache.lock().unwrap();
        if let Some(regex) = cache.get(&pattern_id) {
            return Some(regex.clone());
        }
        match Regex::new(pattern) {
            Ok(regex) => {
                cache.insert(pattern_id, regex.clone());
                Some(regex)
            }
            Err(e) => {
                warn!("skipping unparseable pattern {}: {}", pattern_id, e);
                None
            }
        }
    }

    /// Stage 2: beacon allow-list check, independent of risk level.
    ///
    /// An empty list means unrestricted. Commands are matched on the program
    /// name of each shell line; paths on absolute-path prefixes.
    pub fn policy_violation(command_text: &str, policy: &BeaconPolicy) -> Option<String> {
        if !policy.allowed_commands.is_empty() {
            for line in command_text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let program = line.split_whitespace().next().unwrap_or(line);
                let base = program.rsplit('/').next().unwrap_or(program);
                let allowed = policy
                    .allowed_commands
                    .iter()
                    .any(|entry| entry == base || entry == line);
                if !allowed {
                    return Some(format!("command '{}' is not in the beacon allow list", base));
                }
            }
        }
        if !policy.allowed_paths.is_empty() {
            for token in command_text.split_whitespace().filter(|t| t.starts_with('/')) {
                let allowed = policy
                    .allowed_paths
                    .iter()
                    .any(|prefix| token.starts_with(prefix.as_str()));
                if !allowed {
                    return Some(format!(
                        "path '{}' is outside the beacon's allowed paths",
                        token
                    ));
                }
            }
        }
        None
    }

    /// Stage 3: semantic judge, fail-open.
    ///
    /// Unreachable or slow classifiers degrade the decision to the pattern
    /// result and leave a warning; they never block the request on their own.
    pub async fn judge_stage(
        &self,
        command_text: &str,
        context: &JudgeContext,
        mut analysis: PatternAnalysis,
    ) -> PatternAnalysis {
        let judge = match &self.judge {
            Some(j) => j,
            None => return analysis,
        };
        match tokio::time::timeout(self.judge_timeout, judge.assess(command_text, context)).await {
            Ok(Ok(assessment)) => {
                if assessment.risk_level > analysis.risk_level {
                    analysis.risk_level = assessment.risk_level;
                }
                analysis.warnings.extend(assessment.warnings);
            }
            Ok(Err(e)) => {
                warn!("semantic judge failed: {}", e);
                analysis
                    .warnings
                    .push("degraded analysis: semantic judge unavailable".to_string());
            }
            Err(_) => {
                warn!("semantic judge timed out after {:?}", self.judge_timeout);
                analysis
                    .warnings
                    .push("degraded analysis: semantic judge timed out".to_string());
            }
        }
        analysis
    }

    /// Stage 4: approval gate.
    pub fn decide(&self, analysis: PatternAnalysis, auto_approve: bool) -> Decision {
        let mut warnings = analysis.warnings;
        if analysis.risk_level >= self.approval_threshold {
            if auto_approve {
                warnings.push(format!(
                    "approval gate bypassed by auto-approve at {} risk",
                    analysis.risk_level.as_str()
                ));
                return Decision {
                    outcome: Outcome::Allow,
                    risk_level: analysis.risk_level,
                    warnings,
                    block_reason: None,
                    auto_approved: true,
                };
            }
            return Decision {
                outcome: Outcome::RequireApproval,
                risk_level: analysis.risk_level,
                warnings,
                block_reason: None,
                auto_approved: false,
            };
        }
        Decision {
            outcome: Outcome::Allow,
            risk_level: analysis.risk_level,
            warnings,
            block_reason: None,
            auto_approved: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::types::RiskAssessment;
    use crate::storage::database_storage::DatabaseStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJudge {
        calls: AtomicUsize,
        risk: RiskLevel,
    }

    impl CountingJudge {
        fn new(risk: RiskLevel) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                risk,
            }
        }
    }

    #[async_trait]
    impl SemanticJudge for CountingJudge {
        async fn assess(
            &self,
            _command: &str,
            _context: &JudgeContext,
        ) -> Result<RiskAssessment, SecurityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RiskAssessment {
                risk_level: self.risk,
                rationale: "test".into(),
                warnings: vec!["semantic: test warning".into()],
            })
        }
    }

    struct HangingJudge;

    #[async_trait]
    impl SemanticJudge for HangingJudge {
        async fn assess(
            &self,
            _command: &str,
            _context: &JudgeContext,
        ) -> Result<RiskAssessment, SecurityError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    async fn temp_store() -> Arc<DatabaseStore> {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.sqlite3");
        Box::leak(Box::new(dir));
        Arc::new(DatabaseStore::new_file(&path).await.unwrap())
    }

    fn pipeline(
        store: Arc<DatabaseStore>,
        judge: Option<Arc<dyn SemanticJudge>>,
    ) -> AnalysisPipeline {
        AnalysisPipeline::new(store, judge, RiskLevel::High, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_root_wipe_blocks_at_critical() {
        let store = temp_store().await;
        let pipeline = pipeline(store, None);
        let decision = pipeline
            .analyze(
                "rm -rf /",
                "tenant-a",
                &BeaconPolicy::default(),
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.outcome, Outcome::Block);
        assert_eq!(decision.risk_level, RiskLevel::Critical);
        assert!(decision.block_reason.is_some());
    }

    #[tokio::test]
    async fn test_plain_listing_allowed() {
        let store = temp_store().await;
        let pipeline = pipeline(store, None);
        let decision = pipeline
            .analyze(
                "ls -la",
                "tenant-a",
                &BeaconPolicy::default(),
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.outcome, Outcome::Allow);
        assert_eq!(decision.risk_level, RiskLevel::Low);
        assert!(decision.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_judge_never_runs_on_blocked_input() {
        let store = temp_store().await;
        let judge = Arc::new(CountingJudge::new(RiskLevel::Low));
        let pipeline = pipeline(store, Some(judge.clone()));
        let decision = pipeline
            .analyze(
                "rm -rf /",
                "tenant-a",
                &BeaconPolicy::default(),
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.outcome, Outcome::Block);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_judge_raises_but_never_lowers_risk() {
        let store = temp_store().await;
        // "shutdown now" matches a High default pattern; a Low judge verdict
        // must not lower it, a Critical one must raise it.
        let low_judge = Arc::new(CountingJudge::new(RiskLevel::Low));
        let pipeline_low = pipeline(store.clone(), Some(low_judge));
        let decision = pipeline_low
            .analyze(
                "shutdown now",
                "tenant-a",
                &BeaconPolicy::default(),
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.risk_level, RiskLevel::High);

        let critical_judge = Arc::new(CountingJudge::new(RiskLevel::Critical));
        let pipeline_critical = pipeline(store, Some(critical_judge));
        let decision = pipeline_critical
            .analyze(
                "shutdown now",
                "tenant-a",
                &BeaconPolicy::default(),
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn test_judge_timeout_fails_open_with_warning() {
        let store = temp_store().await;
        let pipeline = pipeline(store, Some(Arc::new(HangingJudge)));
        let decision = pipeline
            .analyze(
                "uptime",
                "tenant-a",
                &BeaconPolicy::default(),
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.outcome, Outcome::Allow);
        assert!(decision
            .warnings
            .iter()
            .any(|w| w.contains("degraded analysis")));
    }

    #[tokio::test]
    async fn test_pattern_regexes_compile_once_and_are_reused() {
        let store = temp_store().await;
        let pattern_count = store.active_patterns("tenant-a").await.unwrap().len();
        let pipeline = pipeline(store, None);

        pipeline
            .pattern_stage("ls -la", "tenant-a")
            .await
            .unwrap();
        assert_eq!(
            pipeline.regex_cache.lock().unwrap().len(),
            pattern_count
        );

        // A second run hits the cache instead of growing it.
        pipeline
            .pattern_stage("rm -rf /", "tenant-a")
            .await
            .unwrap();
        assert_eq!(
            pipeline.regex_cache.lock().unwrap().len(),
            pattern_count
        );
    }

    #[tokio::test]
    async fn test_allow_list_blocks_independent_of_risk() {
        let store = temp_store().await;
        let pipeline = pipeline(store, None);
        let policy = BeaconPolicy {
            allowed_commands: vec!["uptime".to_string()],
            ..Default::default()
        };
        let decision = pipeline
            .analyze(
                "cat /etc/passwd",
                "tenant-a",
                &policy,
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.outcome, Outcome::Block);
        assert!(decision.block_reason.unwrap().contains("allow list"));

        let decision = pipeline
            .analyze("uptime", "tenant-a", &policy, &JudgeContext::default())
            .await
            .unwrap();
        assert_eq!(decision.outcome, Outcome::Allow);
    }

    #[tokio::test]
    async fn test_path_allow_list() {
        let store = temp_store().await;
        let pipeline = pipeline(store, None);
        let policy = BeaconPolicy {
            allowed_paths: vec!["/var/log".to_string()],
            ..Default::default()
        };
        let decision = pipeline
            .analyze(
                "tail -n 50 /etc/passwd",
                "tenant-a",
                &policy,
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.outcome, Outcome::Block);

        let decision = pipeline
            .analyze(
                "tail -n 50 /var/log/syslog",
                "tenant-a",
                &policy,
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.outcome, Outcome::Allow);
    }

    #[tokio::test]
    async fn test_threshold_requires_approval_and_auto_approve_bypasses() {
        let store = temp_store().await;
        let pipeline = pipeline(store, None);
        let gated = pipeline
            .analyze(
                "shutdown now",
                "tenant-a",
                &BeaconPolicy::default(),
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(gated.outcome, Outcome::RequireApproval);
        assert!(!gated.auto_approved);

        let policy = BeaconPolicy {
            auto_approve: true,
            ..Default::default()
        };
        let bypassed = pipeline
            .analyze(
                "shutdown now",
                "tenant-a",
                &policy,
                &JudgeContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(bypassed.outcome, Outcome::Allow);
        assert!(bypassed.auto_approved);
        assert!(bypassed
            .warnings
            .iter()
            .any(|w| w.contains("auto-approve")));
    }
}
