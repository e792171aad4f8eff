//! Command dispatch service.
//!
//! Owns the `queued -> sent -> {completed | failed | timeout}` state
//! machine, the approval gate, and target resolution. Every state write
//! goes through a compare-and-set in the store so concurrent writers (the
//! correlator, the stale sweep, a racing approval) cannot resurrect a
//! command out of a terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use uuid::Uuid;

use super::correlator::ResultCorrelator;
use super::types::{
    ApprovalDecision, ApprovalState, Command, CommandStatus, DispatchRequest, ExecutionResult,
    Target,
};
use crate::beacons::connection_manager::ConnectionManager;
use crate::beacons::messages::OutboundMessage;
use crate::beacons::types::BeaconRegistration;
use crate::error_handling::types::{DispatchError, StorageError};
use crate::security::pipeline::AnalysisPipeline;
use crate::security::types::{Decision, JudgeContext, Outcome};
use crate::storage::storage_trait::Store;

pub struct DispatchService {
    store: Arc<dyn Store>,
    pipeline: Arc<AnalysisPipeline>,
    connections: Arc<ConnectionManager>,
    correlator: Arc<ResultCorrelator>,
    default_timeout_secs: u64,
}

impl DispatchService {
    pub fn new(
        store: Arc<dyn Store>,
        pipeline: Arc<AnalysisPipeline>,
        connections: Arc<ConnectionManager>,
        correlator: Arc<ResultCorrelator>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            pipeline,
            connections,
            correlator,
            default_timeout_secs,
        }
    }

    /// Dispatch entry point.
    ///
    /// Runs the security pipeline, persists the command, queues or rejects
    /// it, and optionally suspends until completion, failure, or the
    /// requested timeout, whichever is first. The returned snapshot may
    /// show `timed_out = true` while the command keeps executing in the
    /// background.
    pub async fn execute(&self, request: DispatchRequest) -> Result<ExecutionResult, DispatchError> {
        let timeout_seconds = request
            .timeout_seconds
            .unwrap_or(self.default_timeout_secs);
        let beacons = self.resolve_target(&request).await?;
        let context = JudgeContext {
            tenant_id: request.tenant_id.clone(),
            beacon_name: beacons.first().map(|b| b.name.clone()),
            initiated_by: Some(request.initiated_by.clone()),
            agent_id: request.agent_id.clone(),
        };
        if request.target == Target::Broadcast {
            self.dispatch_broadcast(request, timeout_seconds, &beacons, &context)
                .await
        } else {
            self.dispatch_single(request, timeout_seconds, &beacons[0], &context)
                .await
        }
    }

    /// Returns the current snapshot of a command for later polling.
    pub async fn poll(&self, command_id: Uuid) -> Result<Option<ExecutionResult>, DispatchError> {
        Ok(self
            .store
            .get_command(command_id)
            .await?
            .map(|c| ExecutionResult::from_command(&c)))
    }

    /// Records an approval decision for a gated command.
    ///
    /// Only valid while the command still requires approval and has not
    /// been handed to a beacon. Approval releases the command into the
    /// normal delivery path; denial fails it terminally.
    pub async fn decide_approval(
        &self,
        decision: ApprovalDecision,
    ) -> Result<ExecutionResult, DispatchError> {
        let command = self
            .store
            .get_command(decision.command_id)
            .await?
            .ok_or(DispatchError::InvalidApprovalState)?;
        if !command.requires_approval
            || command.approval != ApprovalState::Pending
            || command.status != CommandStatus::Queued
            || command.sent_at.is_some()
        {
            return Err(DispatchError::InvalidApprovalState);
        }
        let updated = self
            .store
            .record_approval(
                decision.command_id,
                decision.approved,
                &decision.decided_by,
                decision.reason.as_deref(),
            )
            .await?;
        if !updated {
            return Err(DispatchError::InvalidApprovalState);
        }
        if decision.approved {
            info!(
                "command {} approved by {}",
                decision.command_id, decision.decided_by
            );
            let command = self
                .store
                .get_command(decision.command_id)
                .await?
                .ok_or(DispatchError::StorageError(StorageError::ReadFailed))?;
            self.try_deliver(&command).await?;
        } else {
            info!(
                "command {} denied by {}",
                decision.command_id, decision.decided_by
            );
            self.correlator.notify(decision.command_id);
        }
        let stored = self
            .store
            .get_command(decision.command_id)
            .await?
            .ok_or(DispatchError::StorageError(StorageError::ReadFailed))?;
        Ok(ExecutionResult::from_command(&stored))
    }

    /// One pass of the stale-command sweep: force-close overdue commands
    /// (sent rows past their execution budget, and stranded queued rows no
    /// beacon ever picked up) and release any leftover waiters.
    pub async fn sweep_stale_once(&self) -> Result<usize, DispatchError> {
        let closed = self.store.sweep_timeouts(Utc::now()).await?;
        for command_id in &closed {
            warn!("command {} force-closed by stale sweep", command_id);
            self.correlator.notify(*command_id);
        }
        Ok(closed.len())
    }

    /// One retention pass: purge terminal command rows older than each
    /// beacon's retention window. Beacons without a window keep history
    /// forever.
    pub async fn purge_retention_once(&self) -> Result<u64, DispatchError> {
        let now = Utc::now();
        let mut purged = 0;
        for beacon in self.store.list_all_beacons().await? {
            if let Some(days) = beacon.retention_days {
                let cutoff = now - chrono::Duration::days(days as i64);
                purged += self.store.purge_expired(beacon.id, cutoff).await?;
            }
        }
        Ok(purged)
    }

    async fn resolve_target(
        &self,
        request: &DispatchRequest,
    ) -> Result<Vec<BeaconRegistration>, DispatchError> {
        match &request.target {
            Target::Named(id) => {
                let beacon = self
                    .store
                    .get_beacon(*id)
                    .await?
                    .filter(|b| !b.disabled && b.tenant_id == request.tenant_id)
                    .ok_or(DispatchError::BeaconNotFound)?;
                Ok(vec![beacon])
            }
            Target::FirstAvailable => {
                let beacon = self
                    .store
                    .list_beacons(&request.tenant_id)
                    .await?
                    .into_iter()
                    .find(|b| b.is_dispatchable())
                    .ok_or(DispatchError::NoAvailableBeacon)?;
                Ok(vec![beacon])
            }
            Target::Broadcast => {
                let beacons: Vec<BeaconRegistration> = self
                    .store
                    .list_beacons(&request.tenant_id)
                    .await?
                    .into_iter()
                    .filter(|b| b.is_dispatchable())
                    .collect();
                if beacons.is_empty() {
                    return Err(DispatchError::NoAvailableBeacon);
                }
                Ok(beacons)
            }
        }
    }

    async fn dispatch_single(
        &self,
        request: DispatchRequest,
        timeout_seconds: u64,
        beacon: &BeaconRegistration,
        context: &JudgeContext,
    ) -> Result<ExecutionResult, DispatchError> {
        let decision = self
            .pipeline
            .analyze(&request.script, &request.tenant_id, &beacon.policy, context)
            .await?;
        let command = Self::build_command(
            &request,
            timeout_seconds,
            Some(beacon.id),
            None,
            &decision,
        );
        self.store.save_command(&command).await?;

        match decision.outcome {
            Outcome::Block => {
                info!(
                    "command {} blocked: {}",
                    command.id,
                    command.blocked_reason.as_deref().unwrap_or("")
                );
                return Ok(ExecutionResult::from_command(&command));
            }
            Outcome::RequireApproval => {
                info!("command {} waiting for approval", command.id);
                return Ok(ExecutionResult::from_command(&command));
            }
            Outcome::Allow => {}
        }

        let receiver = request
            .wait_for_result
            .then(|| self.correlator.subscribe(command.id));
        self.try_deliver(&command).await?;

        let receiver = match receiver {
            Some(rx) => rx,
            None => {
                let stored = self.snapshot(command.id).await?;
                return Ok(ExecutionResult::from_command(&stored));
            }
        };
        match tokio::time::timeout(Duration::from_secs(timeout_seconds), receiver).await {
            Ok(_) => {}
            Err(_) => {
                // The caller gives up; the command keeps running and a late
                // result still applies on the stored row.
                debug!("wait for command {} expired", command.id);
                self.store.mark_wait_expired(command.id).await?;
            }
        }
        let stored = self.snapshot(command.id).await?;
        Ok(ExecutionResult::from_command(&stored))
    }

    async fn dispatch_broadcast(
        &self,
        request: DispatchRequest,
        timeout_seconds: u64,
        beacons: &[BeaconRegistration],
        context: &JudgeContext,
    ) -> Result<ExecutionResult, DispatchError> {
        // Pattern and judge stages run once for the shared command text;
        // the per-beacon stages (policy, approval gate) run per row.
        let analysis = self
            .pipeline
            .pattern_stage(&request.script, &request.tenant_id)
            .await?;
        if let Some(reason) = analysis.block_reason {
            let decision = Decision::block(analysis.risk_level, reason, analysis.warnings);
            let command =
                Self::build_command(&request, timeout_seconds, None, None, &decision);
            self.store.save_command(&command).await?;
            info!("broadcast blocked: {:?}", command.blocked_reason);
            return Ok(ExecutionResult::from_command(&command));
        }
        let analysis = self
            .pipeline
            .judge_stage(&request.script, context, analysis)
            .await;

        let correlation_id = Uuid::new_v4();
        let mut queued = 0;
        for beacon in beacons {
            let decision =
                match AnalysisPipeline::policy_violation(&request.script, &beacon.policy) {
                    Some(reason) => Decision::block(
                        analysis.risk_level,
                        reason,
                        analysis.warnings.clone(),
                    ),
                    None => self
                        .pipeline
                        .decide(analysis.clone(), beacon.policy.auto_approve),
                };
            let command = Self::build_command(
                &request,
                timeout_seconds,
                Some(beacon.id),
                Some(correlation_id),
                &decision,
            );
            self.store.save_command(&command).await?;
            if decision.outcome == Outcome::Allow {
                self.try_deliver(&command).await?;
                queued += 1;
            }
        }
        info!(
            "broadcast {} fanned out to {} of {} beacons",
            correlation_id,
            queued,
            beacons.len()
        );
        Ok(ExecutionResult {
            command_id: None,
            correlation_id: Some(correlation_id),
            success: queued > 0,
            status: CommandStatus::Queued.as_str().to_string(),
            exit_code: None,
            stdout: None,
            stderr: None,
            execution_time_ms: None,
            error: None,
            timed_out: false,
            delivery_failed: false,
            blocked: false,
            blocked_reason: None,
            requires_approval: false,
            risk_level: analysis.risk_level,
            security_warnings: analysis.warnings,
            auto_approved: false,
        })
    }

    /// Hands a queued command to its beacon's live channel.
    ///
    /// No live connection is not an error: the row stays queued with
    /// `delivery_failed = true` for a later checkin to pick up.
    async fn try_deliver(&self, command: &Command) -> Result<(), DispatchError> {
        let beacon_id = match command.beacon_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let message = OutboundMessage::Command {
            command_id: command.id,
            script: command.script.clone(),
        };
        match self.connections.deliver(beacon_id, message).await {
            Ok(()) => {
                if self.store.mark_sent(command.id, Utc::now()).await? {
                    debug!("command {} sent to beacon {}", command.id, beacon_id);
                } else {
                    warn!("command {} left queued state before send stamp", command.id);
                }
            }
            Err(e) => {
                info!(
                    "no live connection for beacon {} ({}), command {} stays queued",
                    beacon_id, e, command.id
                );
                self.store.set_delivery_failed(command.id, true).await?;
            }
        }
        Ok(())
    }

    async fn snapshot(&self, command_id: Uuid) -> Result<Command, DispatchError> {
        self.store
            .get_command(command_id)
            .await?
            .ok_or(DispatchError::StorageError(StorageError::ReadFailed))
    }

    fn build_command(
        request: &DispatchRequest,
        timeout_seconds: u64,
        beacon_id: Option<Uuid>,
        correlation_id: Option<Uuid>,
        decision: &Decision,
    ) -> Command {
        let blocked = decision.outcome == Outcome::Block;
        let requires_approval = decision.outcome == Outcome::RequireApproval;
        Command {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id.clone(),
            beacon_id,
            correlation_id,
            script: request.script.clone(),
            initiated_by: request.initiated_by.clone(),
            agent_id: request.agent_id.clone(),
            timeout_seconds,
            status: CommandStatus::Queued,
            approval: if requires_approval {
                ApprovalState::Pending
            } else {
                ApprovalState::NotRequired
            },
            risk_level: decision.risk_level,
            security_warnings: decision.warnings.clone(),
            blocked,
            blocked_reason: decision.block_reason.clone(),
            requires_approval,
            auto_approved: decision.auto_approved,
            exit_code: None,
            stdout: None,
            stderr: None,
            duration_ms: None,
            working_dir: None,
            error: None,
            timed_out: false,
            delivery_failed: false,
            queued_at: Utc::now(),
            sent_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacons::registry::{BeaconRegistry, NewBeacon};
    use crate::beacons::types::{BeaconMode, BeaconPolicy};
    use crate::dispatch::types::CommandOutcome;
    use crate::security::types::RiskLevel;
    use crate::storage::database_storage::DatabaseStore;
    use tokio::sync::mpsc::Receiver;

    struct Fixture {
        store: Arc<DatabaseStore>,
        service: DispatchService,
        connections: Arc<ConnectionManager>,
        correlator: Arc<ResultCorrelator>,
        registry: BeaconRegistry,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.sqlite3");
        Box::leak(Box::new(dir));
        let store = Arc::new(DatabaseStore::new_file(&path).await.unwrap());
        let connections = Arc::new(ConnectionManager::new(store.clone(), 30, 3));
        let correlator = Arc::new(ResultCorrelator::new(store.clone()));
        let pipeline = Arc::new(AnalysisPipeline::new(
            store.clone(),
            None,
            RiskLevel::High,
            Duration::from_millis(200),
        ));
        let service = DispatchService::new(
            store.clone(),
            pipeline,
            connections.clone(),
            correlator.clone(),
            60,
        );
        let registry = BeaconRegistry::new(store.clone());
        Fixture {
            store,
            service,
            connections,
            correlator,
            registry,
        }
    }

    async fn healthy_beacon(fixture: &Fixture, policy: BeaconPolicy) -> Uuid {
        let (beacon, _) = fixture
            .registry
            .register(NewBeacon {
                tenant_id: "tenant-a".into(),
                name: "web-01".into(),
                mode: BeaconMode::Push,
                poll_interval_secs: 60,
                policy,
                retention_days: None,
                hostname: None,
                os_info: None,
            })
            .await
            .unwrap();
        fixture.registry.checkin(beacon.id).await.unwrap();
        beacon.id
    }

    async fn connect(fixture: &Fixture, beacon_id: Uuid) -> Receiver<OutboundMessage> {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        fixture.connections.register(beacon_id, tx).await.unwrap();
        rx
    }

    fn request(script: &str, target: Target, wait: bool) -> DispatchRequest {
        DispatchRequest {
            script: script.into(),
            target,
            tenant_id: "tenant-a".into(),
            initiated_by: "tests".into(),
            agent_id: None,
            timeout_seconds: Some(5),
            wait_for_result: wait,
        }
    }

    #[tokio::test]
    async fn test_allowed_command_reaches_sent_then_completed() {
        let fixture = fixture().await;
        let beacon_id = healthy_beacon(&fixture, BeaconPolicy::default()).await;
        let mut rx = connect(&fixture, beacon_id).await;

        let result = fixture
            .service
            .execute(request("ls -la", Target::Named(beacon_id), false))
            .await
            .unwrap();
        let command_id = result.command_id.unwrap();
        assert_eq!(result.status, "sent");
        assert!(!result.blocked);

        match rx.recv().await.unwrap() {
            OutboundMessage::Command { command_id: id, script } => {
                assert_eq!(id, command_id);
                assert_eq!(script, "ls -la");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        fixture
            .correlator
            .deliver_result(
                command_id,
                CommandOutcome {
                    exit_code: 0,
                    stdout: "total 0".into(),
                    stderr: String::new(),
                    duration_ms: 5,
                    working_dir: None,
                },
            )
            .await
            .unwrap();
        let polled = fixture.service.poll(command_id).await.unwrap().unwrap();
        assert_eq!(polled.status, "completed");
        assert!(polled.success);
        assert_eq!(polled.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_blocked_command_never_leaves_initial_state() {
        let fixture = fixture().await;
        let beacon_id = healthy_beacon(&fixture, BeaconPolicy::default()).await;
        let mut rx = connect(&fixture, beacon_id).await;

        let result = fixture
            .service
            .execute(request("rm -rf /", Target::Named(beacon_id), false))
            .await
            .unwrap();
        assert!(result.blocked);
        assert_eq!(result.risk_level, RiskLevel::Critical);
        assert!(result.blocked_reason.is_some());

        let stored = fixture
            .store
            .get_command(result.command_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Queued);
        assert!(stored.sent_at.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_connection_sets_delivery_failed() {
        let fixture = fixture().await;
        let beacon_id = healthy_beacon(&fixture, BeaconPolicy::default()).await;

        let result = fixture
            .service
            .execute(request("uptime", Target::Named(beacon_id), false))
            .await
            .unwrap();
        assert_eq!(result.status, "queued");
        assert!(result.delivery_failed);

        // A later checkin picks the stranded command up.
        let picked_up = fixture.registry.checkin(beacon_id).await.unwrap();
        assert_eq!(picked_up.len(), 1);
        let stored = fixture
            .store
            .get_command(result.command_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn test_commands_to_one_beacon_arrive_in_dispatch_order() {
        let fixture = fixture().await;
        let beacon_id = healthy_beacon(&fixture, BeaconPolicy::default()).await;
        let mut rx = connect(&fixture, beacon_id).await;

        let mut dispatched = Vec::new();
        for script in ["uptime", "df -h", "free -m"] {
            let result = fixture
                .service
                .execute(request(script, Target::Named(beacon_id), false))
                .await
                .unwrap();
            dispatched.push((result.command_id.unwrap(), script.to_string()));
        }

        // The single channel behind the connection preserves sent order.
        for (expected_id, expected_script) in dispatched {
            match rx.recv().await.unwrap() {
                OutboundMessage::Command { command_id, script } => {
                    assert_eq!(command_id, expected_id);
                    assert_eq!(script, expected_script);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_creates_one_row_per_healthy_beacon() {
        let fixture = fixture().await;
        let first = healthy_beacon(&fixture, BeaconPolicy::default()).await;
        let second = healthy_beacon(&fixture, BeaconPolicy::default()).await;
        let mut rx_first = connect(&fixture, first).await;
        let mut rx_second = connect(&fixture, second).await;

        let result = fixture
            .service
            .execute(request("uptime", Target::Broadcast, false))
            .await
            .unwrap();
        let correlation_id = result.correlation_id.unwrap();
        assert!(result.success);

        let first_msg = rx_first.recv().await.unwrap();
        let second_msg = rx_second.recv().await.unwrap();
        let mut ids = Vec::new();
        for msg in [first_msg, second_msg] {
            match msg {
                OutboundMessage::Command { command_id, .. } => ids.push(command_id),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_ne!(ids[0], ids[1]);
        for id in ids {
            let stored = fixture.store.get_command(id).await.unwrap().unwrap();
            assert_eq!(stored.correlation_id, Some(correlation_id));
            assert_eq!(stored.status, CommandStatus::Sent);
        }
    }

    #[tokio::test]
    async fn test_wait_times_out_then_late_result_still_applies() {
        let fixture = fixture().await;
        let beacon_id = healthy_beacon(&fixture, BeaconPolicy::default()).await;
        let _rx = connect(&fixture, beacon_id).await;

        let mut req = request("sleep 60", Target::Named(beacon_id), true);
        req.timeout_seconds = Some(1);
        let result = fixture.service.execute(req).await.unwrap();
        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(result.status, "sent");

        // The beacon finishes after the caller gave up; the stored row
        // still picks the result up for a later poll.
        let command_id = result.command_id.unwrap();
        let applied = fixture
            .correlator
            .deliver_result(
                command_id,
                CommandOutcome {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: 60_000,
                    working_dir: None,
                },
            )
            .await
            .unwrap();
        assert!(applied);
        let polled = fixture.service.poll(command_id).await.unwrap().unwrap();
        assert_eq!(polled.status, "completed");
    }

    #[tokio::test]
    async fn test_approval_gate_holds_until_approved() {
        let fixture = fixture().await;
        let beacon_id = healthy_beacon(&fixture, BeaconPolicy::default()).await;
        let mut rx = connect(&fixture, beacon_id).await;

        let result = fixture
            .service
            .execute(request("shutdown now", Target::Named(beacon_id), false))
            .await
            .unwrap();
        assert!(result.requires_approval);
        assert_eq!(result.status, "queued");
        assert!(rx.try_recv().is_err());

        let approved = fixture
            .service
            .decide_approval(ApprovalDecision {
                command_id: result.command_id.unwrap(),
                approved: true,
                decided_by: "operator".into(),
                reason: Some("maintenance window".into()),
            })
            .await
            .unwrap();
        assert_eq!(approved.status, "sent");
        assert!(matches!(
            rx.recv().await.unwrap(),
            OutboundMessage::Command { .. }
        ));
    }

    #[tokio::test]
    async fn test_denied_approval_fails_terminally() {
        let fixture = fixture().await;
        let beacon_id = healthy_beacon(&fixture, BeaconPolicy::default()).await;
        let _rx = connect(&fixture, beacon_id).await;

        let result = fixture
            .service
            .execute(request("shutdown now", Target::Named(beacon_id), false))
            .await
            .unwrap();
        let denied = fixture
            .service
            .decide_approval(ApprovalDecision {
                command_id: result.command_id.unwrap(),
                approved: false,
                decided_by: "operator".into(),
                reason: None,
            })
            .await
            .unwrap();
        assert_eq!(denied.status, "failed");
        assert!(denied.error.unwrap().contains("denied"));

        // A second decision on the same command is rejected.
        let again = fixture
            .service
            .decide_approval(ApprovalDecision {
                command_id: result.command_id.unwrap(),
                approved: true,
                decided_by: "operator".into(),
                reason: None,
            })
            .await;
        assert!(matches!(again, Err(DispatchError::InvalidApprovalState)));
    }

    #[tokio::test]
    async fn test_auto_approve_bypasses_gate_and_is_audited() {
        let fixture = fixture().await;
        let beacon_id = healthy_beacon(
            &fixture,
            BeaconPolicy {
                auto_approve: true,
                ..Default::default()
            },
        )
        .await;
        let mut rx = connect(&fixture, beacon_id).await;

        let result = fixture
            .service
            .execute(request("shutdown now", Target::Named(beacon_id), false))
            .await
            .unwrap();
        assert!(result.auto_approved);
        assert!(!result.requires_approval);
        assert_eq!(result.status, "sent");
        assert!(matches!(
            rx.recv().await.unwrap(),
            OutboundMessage::Command { .. }
        ));
    }

    #[tokio::test]
    async fn test_first_available_without_healthy_beacon_fails() {
        let fixture = fixture().await;
        let result = fixture
            .service
            .execute(request("uptime", Target::FirstAvailable, false))
            .await;
        assert!(matches!(result, Err(DispatchError::NoAvailableBeacon)));
    }

    #[tokio::test]
    async fn test_stale_sweep_closes_undelivered_command_for_absent_beacon() {
        let fixture = fixture().await;
        // Registered and healthy in the store, but never connected, with a
        // zero-day retention window.
        let (beacon, _) = fixture
            .registry
            .register(NewBeacon {
                tenant_id: "tenant-a".into(),
                name: "gone-01".into(),
                mode: BeaconMode::Push,
                poll_interval_secs: 60,
                policy: BeaconPolicy::default(),
                retention_days: Some(0),
                hostname: None,
                os_info: None,
            })
            .await
            .unwrap();

        let mut req = request("uptime", Target::Named(beacon.id), false);
        req.timeout_seconds = Some(0);
        let result = fixture.service.execute(req).await.unwrap();
        assert!(result.delivery_failed);
        assert_eq!(result.status, "queued");
        let command_id = result.command_id.unwrap();

        let closed = fixture.service.sweep_stale_once().await.unwrap();
        assert_eq!(closed, 1);
        let stored = fixture.store.get_command(command_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Timeout);
        assert!(stored.timed_out);
        assert!(stored.completed_at.is_some());

        // Terminal now, so the retention purge can reclaim it.
        let purged = fixture.service.purge_retention_once().await.unwrap();
        assert_eq!(purged, 1);
        assert!(fixture.store.get_command(command_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_sweep_force_closes_sent_command() {
        let fixture = fixture().await;
        let beacon_id = healthy_beacon(&fixture, BeaconPolicy::default()).await;
        let _rx = connect(&fixture, beacon_id).await;

        let mut req = request("sleep 600", Target::Named(beacon_id), false);
        req.timeout_seconds = Some(0);
        let result = fixture.service.execute(req).await.unwrap();
        let command_id = result.command_id.unwrap();

        let closed = fixture.service.sweep_stale_once().await.unwrap();
        assert_eq!(closed, 1);
        let stored = fixture.store.get_command(command_id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Timeout);
        assert!(stored.timed_out);

        // A result after the force-close is discarded.
        let applied = fixture
            .correlator
            .deliver_result(
                command_id,
                CommandOutcome {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: 1,
                    working_dir: None,
                },
            )
            .await
            .unwrap();
        assert!(!applied);
    }
}
