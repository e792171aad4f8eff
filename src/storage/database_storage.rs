use std::env;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use uuid::Uuid;

use crate::beacons::types::{BeaconMode, BeaconPolicy, BeaconRegistration, HealthStatus};
use crate::dispatch::types::{ApprovalState, Command, CommandOutcome, CommandStatus};
use crate::error_handling::types::StorageError;
use crate::security::defaults::system_default_patterns;
use crate::security::types::{PatternCategory, PatternKind, RiskLevel, SecurityPattern};
use crate::storage::storage_trait::Store;

// Internal row mappings to avoid manual try_get
#[derive(Debug, sqlx::FromRow)]
struct BeaconRow {
    id: String,
    tenant_id: String,
    name: String,
    credential_hash: String,
    allowed_commands: String,
    allowed_paths: String,
    auto_approve: i64,
    mode: String,
    poll_interval_secs: i64,
    retention_days: Option<i64>,
    last_checkin: Option<String>,
    health: String,
    hostname: Option<String>,
    os_info: Option<String>,
    disabled: i64,
    registered_at: String,
}

impl BeaconRow {
    fn into_beacon(self) -> Result<BeaconRegistration, StorageError> {
        Ok(BeaconRegistration {
            id: Uuid::parse_str(&self.id).map_err(|_| StorageError::ReadFailed)?,
            tenant_id: self.tenant_id,
            name: self.name,
            credential_hash: self.credential_hash,
            policy: BeaconPolicy {
                allowed_commands: serde_json::from_str(&self.allowed_commands)
                    .map_err(|_| StorageError::ReadFailed)?,
                allowed_paths: serde_json::from_str(&self.allowed_paths)
                    .map_err(|_| StorageError::ReadFailed)?,
                auto_approve: self.auto_approve != 0,
            },
            mode: BeaconMode::parse(&self.mode),
            poll_interval_secs: self.poll_interval_secs as u64,
            retention_days: self.retention_days.map(|d| d as u32),
            last_checkin: parse_timestamp_opt(self.last_checkin)?,
            health: HealthStatus::parse(&self.health),
            hostname: self.hostname,
            os_info: self.os_info,
            disabled: self.disabled != 0,
            registered_at: parse_timestamp(&self.registered_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CommandRow {
    id: String,
    tenant_id: String,
    beacon_id: Option<String>,
    correlation_id: Option<String>,
    script: String,
    initiated_by: String,
    agent_id: Option<String>,
    timeout_seconds: i64,
    status: String,
    approval: String,
    risk_level: String,
    security_warnings: String,
    blocked: i64,
    blocked_reason: Option<String>,
    requires_approval: i64,
    auto_approved: i64,
    exit_code: Option<i64>,
    stdout: Option<String>,
    stderr: Option<String>,
    duration_ms: Option<i64>,
    working_dir: Option<String>,
    error: Option<String>,
    timed_out: i64,
    delivery_failed: i64,
    queued_at: String,
    sent_at: Option<String>,
    completed_at: Option<String>,
}

impl CommandRow {
    fn into_command(self) -> Result<Command, StorageError> {
        Ok(Command {
            id: Uuid::parse_str(&self.id).map_err(|_| StorageError::ReadFailed)?,
            tenant_id: self.tenant_id,
            beacon_id: parse_uuid_opt(self.beacon_id)?,
            correlation_id: parse_uuid_opt(self.correlation_id)?,
            script: self.script,
            initiated_by: self.initiated_by,
            agent_id: self.agent_id,
            timeout_seconds: self.timeout_seconds as u64,
            status: CommandStatus::parse(&self.status),
            approval: ApprovalState::parse(&self.approval),
            risk_level: RiskLevel::parse(&self.risk_level),
            security_warnings: serde_json::from_str(&self.security_warnings)
                .map_err(|_| StorageError::ReadFailed)?,
            blocked: self.blocked != 0,
            blocked_reason: self.blocked_reason,
            requires_approval: self.requires_approval != 0,
            auto_approved: self.auto_approved != 0,
            exit_code: self.exit_code.map(|c| c as i32),
            stdout: self.stdout,
            stderr: self.stderr,
            duration_ms: self.duration_ms,
            working_dir: self.working_dir,
            error: self.error,
            timed_out: self.timed_out != 0,
            delivery_failed: self.delivery_failed != 0,
            queued_at: parse_timestamp(&self.queued_at)?,
            sent_at: parse_timestamp_opt(self.sent_at)?,
            completed_at: parse_timestamp_opt(self.completed_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PatternRow {
    id: String,
    tenant_id: Option<String>,
    pattern: String,
    kind: String,
    risk_level: String,
    description: String,
    category: String,
    is_active: i64,
    created_at: String,
}

impl PatternRow {
    fn into_pattern(self) -> Result<SecurityPattern, StorageError> {
        Ok(SecurityPattern {
            id: Uuid::parse_str(&self.id).map_err(|_| StorageError::ReadFailed)?,
            tenant_id: self.tenant_id,
            pattern: self.pattern,
            kind: PatternKind::parse(&self.kind),
            risk_level: RiskLevel::parse(&self.risk_level),
            description: self.description,
            category: PatternCategory::parse(&self.category),
            is_active: self.is_active != 0,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StorageError::ReadFailed)
}

fn parse_timestamp_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    match raw {
        Some(s) => Ok(Some(parse_timestamp(&s)?)),
        None => Ok(None),
    }
}

fn parse_uuid_opt(raw: Option<String>) -> Result<Option<Uuid>, StorageError> {
    match raw {
        Some(s) => Ok(Some(
            Uuid::parse_str(&s).map_err(|_| StorageError::ReadFailed)?,
        )),
        None => Ok(None),
    }
}

pub struct DatabaseStore {
    pool: Pool<Sqlite>,
}

impl DatabaseStore {
    /// Default database filename used in the application's working directory
    const DEFAULT_DB_FILE: &'static str = "balise.sqlite3";

    /// Create or open the database in the current working directory with the default filename
    pub async fn new() -> Result<Self, StorageError> {
        let cwd = env::current_dir().map_err(|_| StorageError::ConnectionFailed)?;
        let path = cwd.join(Self::DEFAULT_DB_FILE);
        Self::new_file(path).await
    }

    pub async fn new_file<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent).map_err(|_| StorageError::WriteFailed)?;
        }
        let opts = SqliteConnectOptions::from_str("sqlite://")
            .map_err(|_| StorageError::ConnectionFailed)?
            .filename(path_ref)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|_| StorageError::ConnectionFailed)?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        let store = Self { pool };
        store.create_schema().await?;
        store.seed_default_patterns().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS beacons (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                credential_hash TEXT NOT NULL,
                allowed_commands TEXT NOT NULL,
                allowed_paths TEXT NOT NULL,
                auto_approve INTEGER NOT NULL,
                mode TEXT NOT NULL,
                poll_interval_secs INTEGER NOT NULL,
                retention_days INTEGER,
                last_checkin TEXT,
                health TEXT NOT NULL,
                hostname TEXT,
                os_info TEXT,
                disabled INTEGER NOT NULL,
                registered_at TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS commands (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                beacon_id TEXT,
                correlation_id TEXT,
                script TEXT NOT NULL,
                initiated_by TEXT NOT NULL,
                agent_id TEXT,
                timeout_seconds INTEGER NOT NULL,
                status TEXT NOT NULL,
                approval TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                security_warnings TEXT NOT NULL,
                blocked INTEGER NOT NULL,
                blocked_reason TEXT,
                requires_approval INTEGER NOT NULL,
                auto_approved INTEGER NOT NULL,
                exit_code INTEGER,
                stdout TEXT,
                stderr TEXT,
                duration_ms INTEGER,
                working_dir TEXT,
                error TEXT,
                timed_out INTEGER NOT NULL,
                delivery_failed INTEGER NOT NULL,
                queued_at TEXT NOT NULL,
                sent_at TEXT,
                completed_at TEXT
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS patterns (
                id TEXT PRIMARY KEY,
                tenant_id TEXT,
                pattern TEXT NOT NULL,
                kind TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                description TEXT NOT NULL,
                category TEXT NOT NULL,
                is_active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(tenant_id, pattern)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pattern_overrides (
                tenant_id TEXT NOT NULL,
                pattern_id TEXT NOT NULL,
                PRIMARY KEY (tenant_id, pattern_id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    /// Seeds the shared system-default pattern set on first open.
    async fn seed_default_patterns(&self) -> Result<(), StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM patterns WHERE tenant_id IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(|_| StorageError::ReadFailed)?;
        if count > 0 {
            return Ok(());
        }
        for pattern in system_default_patterns() {
            self.save_pattern(&pattern).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for DatabaseStore {
    async fn save_beacon(&self, beacon: &BeaconRegistration) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO beacons (id, tenant_id, name, credential_hash, allowed_commands,
                allowed_paths, auto_approve, mode, poll_interval_secs, retention_days,
                last_checkin, health, hostname, os_info, disabled, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
               name=excluded.name,
               credential_hash=excluded.credential_hash,
               allowed_commands=excluded.allowed_commands,
               allowed_paths=excluded.allowed_paths,
               auto_approve=excluded.auto_approve,
               mode=excluded.mode,
               poll_interval_secs=excluded.poll_interval_secs,
               retention_days=excluded.retention_days,
               last_checkin=excluded.last_checkin,
               health=excluded.health,
               hostname=excluded.hostname,
               os_info=excluded.os_info,
               disabled=excluded.disabled",
        )
        .bind(beacon.id.to_string())
        .bind(&beacon.tenant_id)
        .bind(&beacon.name)
        .bind(&beacon.credential_hash)
        .bind(
            serde_json::to_string(&beacon.policy.allowed_commands)
                .map_err(|_| StorageError::WriteFailed)?,
        )
        .bind(
            serde_json::to_string(&beacon.policy.allowed_paths)
                .map_err(|_| StorageError::WriteFailed)?,
        )
        .bind(beacon.policy.auto_approve as i64)
        .bind(beacon.mode.as_str())
        .bind(beacon.poll_interval_secs as i64)
        .bind(beacon.retention_days.map(|d| d as i64))
        .bind(beacon.last_checkin.map(|t| t.to_rfc3339()))
        .bind(beacon.health.as_str())
        .bind(beacon.hostname.clone())
        .bind(beacon.os_info.clone())
        .bind(beacon.disabled as i64)
        .bind(beacon.registered_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    async fn get_beacon(&self, id: Uuid) -> Result<Option<BeaconRegistration>, StorageError> {
        let row: Option<BeaconRow> = sqlx::query_as("SELECT * FROM beacons WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
        row.map(BeaconRow::into_beacon).transpose()
    }

    async fn list_beacons(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<BeaconRegistration>, StorageError> {
        let rows: Vec<BeaconRow> =
            sqlx::query_as("SELECT * FROM beacons WHERE tenant_id = ?1 ORDER BY registered_at")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|_| StorageError::ReadFailed)?;
        rows.into_iter().map(BeaconRow::into_beacon).collect()
    }

    async fn list_all_beacons(&self) -> Result<Vec<BeaconRegistration>, StorageError> {
        let rows: Vec<BeaconRow> = sqlx::query_as("SELECT * FROM beacons ORDER BY registered_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
        rows.into_iter().map(BeaconRow::into_beacon).collect()
    }

    async fn record_checkin(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query("UPDATE beacons SET last_checkin = ?1 WHERE id = ?2")
            .bind(at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    async fn update_health(
        &self,
        id: Uuid,
        health: HealthStatus,
        expected: Option<HealthStatus>,
    ) -> Result<bool, StorageError> {
        let result = match expected {
            Some(current) => {
                sqlx::query("UPDATE beacons SET health = ?1 WHERE id = ?2 AND health = ?3")
                    .bind(health.as_str())
                    .bind(id.to_string())
                    .bind(current.as_str())
                    .execute(&self.pool)
                    .await
            }
            None => sqlx::query("UPDATE beacons SET health = ?1 WHERE id = ?2")
                .bind(health.as_str())
                .bind(id.to_string())
                .execute(&self.pool)
                .await,
        }
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_disabled(&self, id: Uuid, disabled: bool) -> Result<(), StorageError> {
        sqlx::query("UPDATE beacons SET disabled = ?1 WHERE id = ?2")
            .bind(disabled as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    async fn save_command(&self, command: &Command) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO commands (id, tenant_id, beacon_id, correlation_id, script,
                initiated_by, agent_id, timeout_seconds, status, approval, risk_level,
                security_warnings, blocked, blocked_reason, requires_approval, auto_approved,
                exit_code, stdout, stderr, duration_ms, working_dir, error, timed_out,
                delivery_failed, queued_at, sent_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)
             ON CONFLICT(id) DO UPDATE SET
               status=excluded.status,
               approval=excluded.approval,
               security_warnings=excluded.security_warnings,
               exit_code=excluded.exit_code,
               stdout=excluded.stdout,
               stderr=excluded.stderr,
               duration_ms=excluded.duration_ms,
               working_dir=excluded.working_dir,
               error=excluded.error,
               timed_out=excluded.timed_out,
               delivery_failed=excluded.delivery_failed,
               sent_at=excluded.sent_at,
               completed_at=excluded.completed_at",
        )
        .bind(command.id.to_string())
        .bind(&command.tenant_id)
        .bind(command.beacon_id.map(|b| b.to_string()))
        .bind(command.correlation_id.map(|c| c.to_string()))
        .bind(&command.script)
        .bind(&command.initiated_by)
        .bind(command.agent_id.clone())
        .bind(command.timeout_seconds as i64)
        .bind(command.status.as_str())
        .bind(command.approval.as_str())
        .bind(command.risk_level.as_str())
        .bind(
            serde_json::to_string(&command.security_warnings)
                .map_err(|_| StorageError::WriteFailed)?,
        )
        .bind(command.blocked as i64)
        .bind(command.blocked_reason.clone())
        .bind(command.requires_approval as i64)
        .bind(command.auto_approved as i64)
        .bind(command.exit_code.map(|c| c as i64))
        .bind(command.stdout.clone())
        .bind(command.stderr.clone())
        .bind(command.duration_ms)
        .bind(command.working_dir.clone())
        .bind(command.error.clone())
        .bind(command.timed_out as i64)
        .bind(command.delivery_failed as i64)
        .bind(command.queued_at.to_rfc3339())
        .bind(command.sent_at.map(|t| t.to_rfc3339()))
        .bind(command.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    async fn get_command(&self, id: Uuid) -> Result<Option<Command>, StorageError> {
        let row: Option<CommandRow> = sqlx::query_as("SELECT * FROM commands WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| StorageError::ReadFailed)?;
        row.map(CommandRow::into_command).transpose()
    }

    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE commands SET status = 'sent', sent_at = ?1, delivery_failed = 0
             WHERE id = ?2 AND status = 'queued' AND blocked = 0
               AND approval IN ('not_required', 'approved')",
        )
        .bind(at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_result(
        &self,
        id: Uuid,
        outcome: &CommandOutcome,
    ) -> Result<bool, StorageError> {
        let status = if outcome.exit_code == 0 {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        let result = sqlx::query(
            "UPDATE commands SET status = ?1, exit_code = ?2, stdout = ?3, stderr = ?4,
                duration_ms = ?5, working_dir = ?6, completed_at = ?7
             WHERE id = ?8 AND status IN ('queued', 'sent')",
        )
        .bind(status.as_str())
        .bind(outcome.exit_code as i64)
        .bind(&outcome.stdout)
        .bind(&outcome.stderr)
        .bind(outcome.duration_ms)
        .bind(outcome.working_dir.clone())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_wait_expired(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE commands SET timed_out = 1
             WHERE id = ?1 AND status IN ('queued', 'sent')",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    async fn set_delivery_failed(&self, id: Uuid, failed: bool) -> Result<(), StorageError> {
        sqlx::query("UPDATE commands SET delivery_failed = ?1 WHERE id = ?2")
            .bind(failed as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    async fn record_approval(
        &self,
        id: Uuid,
        approved: bool,
        decided_by: &str,
        reason: Option<&str>,
    ) -> Result<bool, StorageError> {
        let result = if approved {
            sqlx::query(
                "UPDATE commands SET approval = 'approved'
                 WHERE id = ?1 AND approval = 'pending' AND status = 'queued'
                   AND sent_at IS NULL",
            )
            .bind(id.to_string())
            .execute(&self.pool)
            .await
        } else {
            let error = match reason {
                Some(r) => format!("approval denied by {}: {}", decided_by, r),
                None => format!("approval denied by {}", decided_by),
            };
            sqlx::query(
                "UPDATE commands SET approval = 'denied', status = 'failed', error = ?1,
                    completed_at = ?2
                 WHERE id = ?3 AND approval = 'pending' AND status = 'queued'
                   AND sent_at IS NULL",
            )
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
        }
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(result.rows_affected() > 0)
    }

    async fn pending_for_beacon(&self, beacon_id: Uuid) -> Result<Vec<Command>, StorageError> {
        let rows: Vec<CommandRow> = sqlx::query_as(
            "SELECT * FROM commands
             WHERE beacon_id = ?1 AND status = 'queued' AND blocked = 0
               AND approval IN ('not_required', 'approved')
             ORDER BY queued_at",
        )
        .bind(beacon_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|_| StorageError::ReadFailed)?;
        rows.into_iter().map(CommandRow::into_command).collect()
    }

    async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StorageError> {
        // Two classes of overdue rows: sent rows whose execution budget ran
        // out, and deliverable queued rows (typically delivery_failed) whose
        // beacon never came back to pick them up. Blocked and
        // approval-pending rows are excluded; the approval gate has no
        // clock.
        let candidates: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM commands
             WHERE (status = 'sent' AND sent_at IS NOT NULL
                    AND datetime(sent_at, '+' || timeout_seconds || ' seconds') <= datetime(?1))
                OR (status = 'queued' AND blocked = 0
                    AND approval IN ('not_required', 'approved')
                    AND datetime(queued_at, '+' || timeout_seconds || ' seconds') <= datetime(?1))",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(|_| StorageError::ReadFailed)?;

        let mut closed = Vec::new();
        for raw_id in candidates {
            // Per-row CAS: a result racing this sweep wins or loses cleanly.
            let result = sqlx::query(
                "UPDATE commands SET status = 'timeout', timed_out = 1, completed_at = ?1
                 WHERE id = ?2 AND status IN ('queued', 'sent') AND blocked = 0
                   AND approval IN ('not_required', 'approved')",
            )
            .bind(now.to_rfc3339())
            .bind(&raw_id)
            .execute(&self.pool)
            .await
            .map_err(|_| StorageError::WriteFailed)?;
            if result.rows_affected() > 0 {
                closed.push(Uuid::parse_str(&raw_id).map_err(|_| StorageError::ReadFailed)?);
            }
        }
        Ok(closed)
    }

    async fn purge_expired(
        &self,
        beacon_id: Uuid,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM commands
             WHERE beacon_id = ?1 AND status IN ('completed', 'failed', 'timeout')
               AND completed_at IS NOT NULL AND completed_at < ?2",
        )
        .bind(beacon_id.to_string())
        .bind(older_than.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(result.rows_affected())
    }

    async fn save_pattern(&self, pattern: &SecurityPattern) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO patterns (id, tenant_id, pattern, kind, risk_level, description,
                category, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
               is_active=excluded.is_active,
               description=excluded.description",
        )
        .bind(pattern.id.to_string())
        .bind(pattern.tenant_id.clone())
        .bind(&pattern.pattern)
        .bind(pattern.kind.as_str())
        .bind(pattern.risk_level.as_str())
        .bind(&pattern.description)
        .bind(pattern.category.as_str())
        .bind(pattern.is_active as i64)
        .bind(pattern.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }

    async fn active_patterns(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<SecurityPattern>, StorageError> {
        let rows: Vec<PatternRow> = sqlx::query_as(
            "SELECT * FROM patterns
             WHERE is_active = 1
               AND (
                 (tenant_id IS NULL AND id NOT IN (
                    SELECT pattern_id FROM pattern_overrides WHERE tenant_id = ?1))
                 OR tenant_id = ?1
               )
             ORDER BY kind, created_at",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|_| StorageError::ReadFailed)?;
        rows.into_iter().map(PatternRow::into_pattern).collect()
    }

    async fn deactivate_default(
        &self,
        tenant_id: &str,
        pattern_id: Uuid,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR IGNORE INTO pattern_overrides (tenant_id, pattern_id) VALUES (?1, ?2)",
        )
        .bind(tenant_id)
        .bind(pattern_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|_| StorageError::WriteFailed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn temp_db() -> DatabaseStore {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.sqlite3");
        // Keep TempDir alive by leaking it for the test duration
        Box::leak(Box::new(dir));
        DatabaseStore::new_file(path).await.unwrap()
    }

    fn beacon() -> BeaconRegistration {
        BeaconRegistration {
            id: Uuid::new_v4(),
            tenant_id: "tenant-a".into(),
            name: "web-01".into(),
            credential_hash: "abc123".into(),
            policy: BeaconPolicy {
                allowed_commands: vec!["uptime".into()],
                allowed_paths: vec!["/var/log".into()],
                auto_approve: false,
            },
            mode: BeaconMode::Push,
            poll_interval_secs: 60,
            retention_days: Some(7),
            last_checkin: None,
            health: HealthStatus::Unknown,
            hostname: Some("web-01.internal".into()),
            os_info: None,
            disabled: false,
            registered_at: Utc::now(),
        }
    }

    fn command(beacon_id: Option<Uuid>) -> Command {
        Command {
            id: Uuid::new_v4(),
            tenant_id: "tenant-a".into(),
            beacon_id,
            correlation_id: None,
            script: "uptime".into(),
            initiated_by: "tests".into(),
            agent_id: None,
            timeout_seconds: 30,
            status: CommandStatus::Queued,
            approval: ApprovalState::NotRequired,
            risk_level: RiskLevel::Low,
            security_warnings: vec!["note".into()],
            blocked: false,
            blocked_reason: None,
            requires_approval: false,
            auto_approved: false,
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

    fn outcome(exit_code: i32) -> CommandOutcome {
        CommandOutcome {
            exit_code,
            stdout: "out".into(),
            stderr: "err".into(),
            duration_ms: 12,
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_beacon_round_trip() {
        let store = temp_db().await;
        let original = beacon();
        store.save_beacon(&original).await.unwrap();
        let fetched = store.get_beacon(original.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, original.name);
        assert_eq!(fetched.policy.allowed_commands, original.policy.allowed_commands);
        assert_eq!(fetched.policy.allowed_paths, original.policy.allowed_paths);
        assert_eq!(fetched.mode, BeaconMode::Push);
        assert_eq!(fetched.retention_days, Some(7));
        assert_eq!(fetched.health, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_health_cas() {
        let store = temp_db().await;
        let original = beacon();
        store.save_beacon(&original).await.unwrap();
        // Expected state mismatch leaves the row alone.
        let updated = store
            .update_health(original.id, HealthStatus::Offline, Some(HealthStatus::Healthy))
            .await
            .unwrap();
        assert!(!updated);
        let updated = store
            .update_health(original.id, HealthStatus::Healthy, Some(HealthStatus::Unknown))
            .await
            .unwrap();
        assert!(updated);
        let fetched = store.get_beacon(original.id).await.unwrap().unwrap();
        assert_eq!(fetched.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let store = temp_db().await;
        let original = command(None);
        store.save_command(&original).await.unwrap();
        let fetched = store.get_command(original.id).await.unwrap().unwrap();
        assert_eq!(fetched.script, "uptime");
        assert_eq!(fetched.status, CommandStatus::Queued);
        assert_eq!(fetched.security_warnings, vec!["note".to_string()]);
        assert!(fetched.sent_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_sent_only_from_queued() {
        let store = temp_db().await;
        let original = command(None);
        store.save_command(&original).await.unwrap();
        assert!(store.mark_sent(original.id, Utc::now()).await.unwrap());
        // Second attempt loses the CAS.
        assert!(!store.mark_sent(original.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_sent_refuses_blocked_and_gated_rows() {
        let store = temp_db().await;
        let mut blocked = command(None);
        blocked.blocked = true;
        blocked.blocked_reason = Some("blocked pattern".into());
        store.save_command(&blocked).await.unwrap();
        assert!(!store.mark_sent(blocked.id, Utc::now()).await.unwrap());

        let mut gated = command(None);
        gated.requires_approval = true;
        gated.approval = ApprovalState::Pending;
        store.save_command(&gated).await.unwrap();
        assert!(!store.mark_sent(gated.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_result_respects_terminal_state() {
        let store = temp_db().await;
        let original = command(None);
        store.save_command(&original).await.unwrap();
        store.mark_sent(original.id, Utc::now()).await.unwrap();
        assert!(store.apply_result(original.id, &outcome(1)).await.unwrap());
        let fetched = store.get_command(original.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, CommandStatus::Failed);
        // Terminal now; a replay does not land.
        assert!(!store.apply_result(original.id, &outcome(0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_timeouts_closes_overdue_sent_rows() {
        let store = temp_db().await;
        let mut overdue = command(None);
        overdue.timeout_seconds = 10;
        store.save_command(&overdue).await.unwrap();
        store
            .mark_sent(overdue.id, Utc::now() - Duration::seconds(60))
            .await
            .unwrap();
        let mut fresh = command(None);
        fresh.timeout_seconds = 300;
        store.save_command(&fresh).await.unwrap();
        store.mark_sent(fresh.id, Utc::now()).await.unwrap();

        let closed = store.sweep_timeouts(Utc::now()).await.unwrap();
        assert_eq!(closed, vec![overdue.id]);
        let fetched = store.get_command(overdue.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, CommandStatus::Timeout);
        assert!(fetched.timed_out);
        let fetched = store.get_command(fresh.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn test_sweep_timeouts_closes_stranded_queued_rows() {
        let store = temp_db().await;
        let mut stranded = command(None);
        stranded.timeout_seconds = 0;
        stranded.delivery_failed = true;
        store.save_command(&stranded).await.unwrap();

        // Gated and blocked rows sit in queued too, but have no clock.
        let mut gated = command(None);
        gated.timeout_seconds = 0;
        gated.requires_approval = true;
        gated.approval = ApprovalState::Pending;
        store.save_command(&gated).await.unwrap();
        let mut blocked = command(None);
        blocked.timeout_seconds = 0;
        blocked.blocked = true;
        store.save_command(&blocked).await.unwrap();

        let closed = store.sweep_timeouts(Utc::now()).await.unwrap();
        assert_eq!(closed, vec![stranded.id]);
        let fetched = store.get_command(stranded.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, CommandStatus::Timeout);
        assert!(fetched.timed_out);
        assert!(fetched.completed_at.is_some());
        for id in [gated.id, blocked.id] {
            let fetched = store.get_command(id).await.unwrap().unwrap();
            assert_eq!(fetched.status, CommandStatus::Queued);
        }
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_recent_rows() {
        let store = temp_db().await;
        let b = beacon();
        store.save_beacon(&b).await.unwrap();
        let old = command(Some(b.id));
        store.save_command(&old).await.unwrap();
        store
            .mark_sent(old.id, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        store.apply_result(old.id, &outcome(0)).await.unwrap();
        // Rewrite completed_at into the past.
        sqlx::query("UPDATE commands SET completed_at = ?1 WHERE id = ?2")
            .bind((Utc::now() - Duration::days(30)).to_rfc3339())
            .bind(old.id.to_string())
            .execute(&store.pool)
            .await
            .unwrap();
        let recent = command(Some(b.id));
        store.save_command(&recent).await.unwrap();
        store.mark_sent(recent.id, Utc::now()).await.unwrap();
        store.apply_result(recent.id, &outcome(0)).await.unwrap();

        let purged = store
            .purge_expired(b.id, Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_command(old.id).await.unwrap().is_none());
        assert!(store.get_command(recent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_default_patterns_seeded_once() {
        let store = temp_db().await;
        let patterns = store.active_patterns("tenant-a").await.unwrap();
        assert!(!patterns.is_empty());
        assert!(patterns.iter().all(|p| p.is_system_default()));
    }

    #[tokio::test]
    async fn test_tenant_patterns_add_and_deactivation_overrides() {
        let store = temp_db().await;
        let defaults = store.active_patterns("tenant-a").await.unwrap();
        let baseline = defaults.len();

        let tenant_pattern = SecurityPattern {
            id: Uuid::new_v4(),
            tenant_id: Some("tenant-a".into()),
            pattern: r"docker\s+login".into(),
            kind: PatternKind::HighRisk,
            risk_level: RiskLevel::Medium,
            description: "registry credential use".into(),
            category: PatternCategory::Container,
            is_active: true,
            created_at: Utc::now(),
        };
        store.save_pattern(&tenant_pattern).await.unwrap();
        assert_eq!(
            store.active_patterns("tenant-a").await.unwrap().len(),
            baseline + 1
        );
        // Other tenants never see tenant-a's additions.
        assert_eq!(
            store.active_patterns("tenant-b").await.unwrap().len(),
            baseline
        );

        store
            .deactivate_default("tenant-a", defaults[0].id)
            .await
            .unwrap();
        assert_eq!(
            store.active_patterns("tenant-a").await.unwrap().len(),
            baseline
        );
        // The shared default row is untouched for everyone else.
        assert_eq!(
            store.active_patterns("tenant-b").await.unwrap().len(),
            baseline
        );
    }
}
