use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anvil_common::{
    BuildAttempt, BuildIteration, BuildState, Diagnostic, FeatureRequest, ImplementationPlan,
    Outcome, SnapshotId,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::models::*;
use crate::config::BuildConfig;

/// Async-safe handle to the factory database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FactoryDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct FactoryDb {
    conn: Connection,
}

const FACTORY_COLUMNS: &str = "id, tenant_id, name, status, assistants, config, current_snapshot_id, gate_on_setup, created_at, updated_at";
const SETUP_TASK_COLUMNS: &str =
    "id, factory_id, category, title, status, required, created_at, updated_at";
const ATTEMPT_COLUMNS: &str = "id, factory_id, feature_request_id, plan, outcome, max_iterations, states, final_snapshot_id, error, started_at, ended_at";
const ESCALATION_COLUMNS: &str = "id, attempt_id, factory_id, feature_request_id, iteration_count, final_diagnostics, snapshot_id, artifact_path, created_at";

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS factories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tenant_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'provisioning',
                    assistants TEXT NOT NULL DEFAULT '[]',
                    config TEXT NOT NULL,
                    current_snapshot_id TEXT,
                    gate_on_setup INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS setup_tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    factory_id INTEGER NOT NULL REFERENCES factories(id) ON DELETE CASCADE,
                    category TEXT NOT NULL,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    required INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS feature_requests (
                    id TEXT PRIMARY KEY,
                    factory_id INTEGER NOT NULL REFERENCES factories(id) ON DELETE CASCADE,
                    description TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS build_attempts (
                    id TEXT PRIMARY KEY,
                    factory_id INTEGER NOT NULL REFERENCES factories(id) ON DELETE CASCADE,
                    feature_request_id TEXT NOT NULL REFERENCES feature_requests(id),
                    plan TEXT,
                    outcome TEXT NOT NULL DEFAULT 'pending',
                    max_iterations INTEGER NOT NULL,
                    states TEXT NOT NULL DEFAULT '[]',
                    final_snapshot_id TEXT,
                    error TEXT,
                    started_at TEXT NOT NULL,
                    ended_at TEXT
                );

                CREATE TABLE IF NOT EXISTS build_iterations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    attempt_id TEXT NOT NULL REFERENCES build_attempts(id) ON DELETE CASCADE,
                    iteration_index INTEGER NOT NULL,
                    passed INTEGER NOT NULL DEFAULT 0,
                    data TEXT NOT NULL,
                    UNIQUE(attempt_id, iteration_index)
                );

                CREATE TABLE IF NOT EXISTS escalations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    attempt_id TEXT NOT NULL UNIQUE REFERENCES build_attempts(id),
                    factory_id INTEGER NOT NULL REFERENCES factories(id) ON DELETE CASCADE,
                    feature_request_id TEXT NOT NULL,
                    iteration_count INTEGER NOT NULL,
                    final_diagnostics TEXT NOT NULL DEFAULT '[]',
                    snapshot_id TEXT,
                    artifact_path TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_factories_tenant ON factories(tenant_id);
                CREATE INDEX IF NOT EXISTS idx_setup_tasks_factory ON setup_tasks(factory_id);
                CREATE INDEX IF NOT EXISTS idx_build_attempts_factory ON build_attempts(factory_id);
                CREATE INDEX IF NOT EXISTS idx_build_iterations_attempt ON build_iterations(attempt_id);
                CREATE INDEX IF NOT EXISTS idx_escalations_factory ON escalations(factory_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Factories ─────────────────────────────────────────────────────

    pub fn create_factory(
        &self,
        tenant_id: &str,
        name: &str,
        assistants: &[String],
        config: &BuildConfig,
        gate_on_setup: bool,
    ) -> Result<Factory> {
        let assistants =
            serde_json::to_string(assistants).context("Failed to serialize assistants")?;
        let config = serde_json::to_string(config).context("Failed to serialize build config")?;
        self.conn
            .execute(
                "INSERT INTO factories (tenant_id, name, assistants, config, gate_on_setup)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![tenant_id, name, assistants, config, gate_on_setup],
            )
            .context("Failed to insert factory")?;
        let id = self.conn.last_insert_rowid();
        self.get_factory(id)?
            .context("Factory not found after insert")
    }

    pub fn get_factory(&self, id: i64) -> Result<Option<Factory>> {
        let sql = format!("SELECT {} FROM factories WHERE id = ?1", FACTORY_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], FactoryRow::read)
            .optional()
            .context("Failed to query factory")?;
        row.map(FactoryRow::into_factory).transpose()
    }

    pub fn list_factories(&self, tenant_id: Option<&str>) -> Result<Vec<Factory>> {
        let sql = match tenant_id {
            Some(_) => format!(
                "SELECT {} FROM factories WHERE tenant_id = ?1 ORDER BY id",
                FACTORY_COLUMNS
            ),
            None => format!("SELECT {} FROM factories ORDER BY id", FACTORY_COLUMNS),
        };
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_factories")?;
        let rows = match tenant_id {
            Some(tenant) => stmt.query_map(params![tenant], FactoryRow::read),
            None => stmt.query_map([], FactoryRow::read),
        }
        .context("Failed to query factories")?;
        let mut factories = Vec::new();
        for row in rows {
            factories.push(row.context("Failed to read factory row")?.into_factory()?);
        }
        Ok(factories)
    }

    /// Write a status without checking the transition. See `Registry`.
    pub fn set_factory_status(&self, id: i64, status: FactoryStatus) -> Result<Factory> {
        self.conn
            .execute(
                "UPDATE factories SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update factory status")?;
        self.get_factory(id)?
            .context("Factory not found after status update")
    }

    pub fn set_current_snapshot(&self, id: i64, snapshot: Option<&SnapshotId>) -> Result<Factory> {
        self.conn
            .execute(
                "UPDATE factories SET current_snapshot_id = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![snapshot.map(SnapshotId::as_str), id],
            )
            .context("Failed to update factory snapshot")?;
        self.get_factory(id)?
            .context("Factory not found after snapshot update")
    }

    // ── Setup tasks ───────────────────────────────────────────────────

    pub fn create_setup_task(
        &self,
        factory_id: i64,
        category: SetupCategory,
        title: &str,
        required: bool,
    ) -> Result<SetupTask> {
        self.conn
            .execute(
                "INSERT INTO setup_tasks (factory_id, category, title, required) VALUES (?1, ?2, ?3, ?4)",
                params![factory_id, category.as_str(), title, required],
            )
            .context("Failed to insert setup task")?;
        let id = self.conn.last_insert_rowid();
        self.get_setup_task(id)?
            .context("Setup task not found after insert")
    }

    pub fn get_setup_task(&self, id: i64) -> Result<Option<SetupTask>> {
        let sql = format!("SELECT {} FROM setup_tasks WHERE id = ?1", SETUP_TASK_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], SetupTaskRow::read)
            .optional()
            .context("Failed to query setup task")?;
        row.map(SetupTaskRow::into_setup_task).transpose()
    }

    pub fn list_setup_tasks(&self, factory_id: i64) -> Result<Vec<SetupTask>> {
        let sql = format!(
            "SELECT {} FROM setup_tasks WHERE factory_id = ?1 ORDER BY id",
            SETUP_TASK_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_setup_tasks")?;
        let rows = stmt
            .query_map(params![factory_id], SetupTaskRow::read)
            .context("Failed to query setup tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read setup task row")?.into_setup_task()?);
        }
        Ok(tasks)
    }

    pub fn update_setup_task_status(&self, id: i64, status: SetupTaskStatus) -> Result<SetupTask> {
        self.conn
            .execute(
                "UPDATE setup_tasks SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update setup task")?;
        self.get_setup_task(id)?
            .context("Setup task not found after update")
    }

    // ── Feature requests ──────────────────────────────────────────────

    pub fn insert_feature_request(&self, request: &FeatureRequest) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO feature_requests (id, factory_id, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    request.id.to_string(),
                    request.factory_id,
                    request.description,
                    request.created_at.to_rfc3339()
                ],
            )
            .context("Failed to insert feature request")?;
        Ok(())
    }

    pub fn get_feature_request(&self, id: Uuid) -> Result<Option<FeatureRequest>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, factory_id, description, created_at FROM feature_requests WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query feature request")?;
        row.map(|(id, factory_id, description, created_at)| {
            Ok(FeatureRequest {
                id: parse_uuid(&id)?,
                factory_id,
                description,
                created_at: parse_time(&created_at)?,
            })
        })
        .transpose()
    }

    // ── Build attempts ────────────────────────────────────────────────

    pub fn insert_attempt(&self, attempt: &BuildAttempt) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO build_attempts (id, factory_id, feature_request_id, outcome, max_iterations, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attempt.id.to_string(),
                    attempt.factory_id,
                    attempt.feature_request_id.to_string(),
                    attempt.outcome.as_str(),
                    attempt.max_iterations,
                    attempt.started_at.to_rfc3339()
                ],
            )
            .context("Failed to insert build attempt")?;
        self.update_attempt(attempt)
    }

    /// Persist the mutable header fields of an attempt. Iterations are
    /// written separately with `upsert_iteration`.
    pub fn update_attempt(&self, attempt: &BuildAttempt) -> Result<()> {
        let plan = attempt
            .plan
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize plan")?;
        let states = serde_json::to_string(&attempt.states).context("Failed to serialize states")?;
        self.conn
            .execute(
                "UPDATE build_attempts
                 SET plan = ?1, outcome = ?2, states = ?3, final_snapshot_id = ?4, error = ?5, ended_at = ?6
                 WHERE id = ?7",
                params![
                    plan,
                    attempt.outcome.as_str(),
                    states,
                    attempt.final_snapshot_id.as_ref().map(SnapshotId::as_str),
                    attempt.error,
                    attempt.ended_at.map(|t| t.to_rfc3339()),
                    attempt.id.to_string()
                ],
            )
            .context("Failed to update build attempt")?;
        Ok(())
    }

    pub fn upsert_iteration(&self, attempt_id: Uuid, iteration: &BuildIteration) -> Result<()> {
        let data = serde_json::to_string(iteration).context("Failed to serialize iteration")?;
        self.conn
            .execute(
                "INSERT INTO build_iterations (attempt_id, iteration_index, passed, data)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(attempt_id, iteration_index) DO UPDATE SET passed = excluded.passed, data = excluded.data",
                params![
                    attempt_id.to_string(),
                    iteration.iteration_index,
                    iteration.passed(),
                    data
                ],
            )
            .context("Failed to upsert build iteration")?;
        Ok(())
    }

    pub fn get_attempt(&self, id: Uuid) -> Result<Option<BuildAttempt>> {
        let sql = format!("SELECT {} FROM build_attempts WHERE id = ?1", ATTEMPT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id.to_string()], AttemptRow::read)
            .optional()
            .context("Failed to query build attempt")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let iterations = self.get_iterations(id)?;
        Ok(Some(row.into_attempt(iterations)?))
    }

    fn get_iterations(&self, attempt_id: Uuid) -> Result<Vec<BuildIteration>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT data FROM build_iterations WHERE attempt_id = ?1 ORDER BY iteration_index",
            )
            .context("Failed to prepare get_iterations")?;
        let rows = stmt
            .query_map(params![attempt_id.to_string()], |row| row.get::<_, String>(0))
            .context("Failed to query build iterations")?;
        let mut iterations = Vec::new();
        for row in rows {
            let data = row.context("Failed to read iteration row")?;
            iterations
                .push(serde_json::from_str(&data).context("Failed to parse iteration JSON")?);
        }
        Ok(iterations)
    }

    pub fn list_attempts(&self, factory_id: i64) -> Result<Vec<AttemptSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.id, a.factory_id, a.feature_request_id, f.description, a.outcome, a.states,
                        (SELECT COUNT(*) FROM build_iterations i WHERE i.attempt_id = a.id),
                        a.max_iterations, a.final_snapshot_id, a.error, a.started_at, a.ended_at
                 FROM build_attempts a
                 JOIN feature_requests f ON f.id = a.feature_request_id
                 WHERE a.factory_id = ?1
                 ORDER BY a.started_at DESC",
            )
            .context("Failed to prepare list_attempts")?;
        let rows = stmt
            .query_map(params![factory_id], |row| {
                Ok(AttemptSummaryRow {
                    id: row.get(0)?,
                    factory_id: row.get(1)?,
                    feature_request_id: row.get(2)?,
                    description: row.get(3)?,
                    outcome: row.get(4)?,
                    states: row.get(5)?,
                    iteration_count: row.get(6)?,
                    max_iterations: row.get(7)?,
                    final_snapshot_id: row.get(8)?,
                    error: row.get(9)?,
                    started_at: row.get(10)?,
                    ended_at: row.get(11)?,
                })
            })
            .context("Failed to query build attempts")?;
        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row.context("Failed to read attempt row")?.into_summary()?);
        }
        Ok(attempts)
    }

    /// Close attempts left pending by a previous process. Returns how many
    /// were marked fatal.
    pub fn fail_orphaned_attempts(&self) -> Result<usize> {
        let n = self
            .conn
            .execute(
                "UPDATE build_attempts
                 SET outcome = 'fatal', error = 'server stopped while attempt was in flight', ended_at = ?1
                 WHERE outcome = 'pending'",
                params![Utc::now().to_rfc3339()],
            )
            .context("Failed to close orphaned attempts")?;
        Ok(n)
    }

    // ── Escalations ───────────────────────────────────────────────────

    /// Insert an escalation unless one exists for the attempt already.
    /// Returns the stored record and whether this call created it.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_escalation(
        &self,
        attempt_id: Uuid,
        factory_id: i64,
        feature_request_id: Uuid,
        iteration_count: u32,
        final_diagnostics: &[Diagnostic],
        snapshot_id: Option<&SnapshotId>,
        artifact_path: &str,
    ) -> Result<(EscalationRecord, bool)> {
        let diagnostics = serde_json::to_string(final_diagnostics)
            .context("Failed to serialize final diagnostics")?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO escalations
                 (attempt_id, factory_id, feature_request_id, iteration_count, final_diagnostics, snapshot_id, artifact_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attempt_id.to_string(),
                    factory_id,
                    feature_request_id.to_string(),
                    iteration_count,
                    diagnostics,
                    snapshot_id.map(SnapshotId::as_str),
                    artifact_path
                ],
            )
            .context("Failed to insert escalation")?;
        let record = self
            .get_escalation_by_attempt(attempt_id)?
            .context("Escalation not found after insert")?;
        Ok((record, inserted > 0))
    }

    pub fn get_escalation_by_attempt(&self, attempt_id: Uuid) -> Result<Option<EscalationRecord>> {
        let sql = format!(
            "SELECT {} FROM escalations WHERE attempt_id = ?1",
            ESCALATION_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![attempt_id.to_string()], EscalationRow::read)
            .optional()
            .context("Failed to query escalation")?;
        row.map(EscalationRow::into_record).transpose()
    }

    pub fn list_escalations(&self, factory_id: i64) -> Result<Vec<EscalationRecord>> {
        let sql = format!(
            "SELECT {} FROM escalations WHERE factory_id = ?1 ORDER BY id",
            ESCALATION_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_escalations")?;
        let rows = stmt
            .query_map(params![factory_id], EscalationRow::read)
            .context("Failed to query escalations")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read escalation row")?.into_record()?);
        }
        Ok(records)
    }
}

// ── Row conversion ────────────────────────────────────────────────────

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid UUID in database: {}", s))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp in database: {}", s))?
        .with_timezone(&Utc))
}

fn parse_snapshot_id(s: Option<String>) -> Result<Option<SnapshotId>> {
    s.map(|s| SnapshotId::from_str(&s).map_err(|e| anyhow::anyhow!(e)))
        .transpose()
}

/// Intermediate row struct for factories before converting the status,
/// assistants and config columns into typed values.
struct FactoryRow {
    id: i64,
    tenant_id: String,
    name: String,
    status: String,
    assistants: String,
    config: String,
    current_snapshot_id: Option<String>,
    gate_on_setup: bool,
    created_at: String,
    updated_at: String,
}

impl FactoryRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            name: row.get(2)?,
            status: row.get(3)?,
            assistants: row.get(4)?,
            config: row.get(5)?,
            current_snapshot_id: row.get(6)?,
            gate_on_setup: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_factory(self) -> Result<Factory> {
        let status = FactoryStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse factory status")?;
        let assistants: Vec<String> = serde_json::from_str(&self.assistants)
            .context("Failed to parse factory assistants JSON")?;
        let config: BuildConfig =
            serde_json::from_str(&self.config).context("Failed to parse factory config JSON")?;
        Ok(Factory {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            status,
            assistants,
            config,
            current_snapshot_id: parse_snapshot_id(self.current_snapshot_id)?,
            gate_on_setup: self.gate_on_setup,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct SetupTaskRow {
    id: i64,
    factory_id: i64,
    category: String,
    title: String,
    status: String,
    required: bool,
    created_at: String,
    updated_at: String,
}

impl SetupTaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            factory_id: row.get(1)?,
            category: row.get(2)?,
            title: row.get(3)?,
            status: row.get(4)?,
            required: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_setup_task(self) -> Result<SetupTask> {
        let category = SetupCategory::from_str(&self.category)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse setup category")?;
        let status = SetupTaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse setup task status")?;
        Ok(SetupTask {
            id: self.id,
            factory_id: self.factory_id,
            category,
            title: self.title,
            status,
            required: self.required,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct AttemptRow {
    id: String,
    factory_id: i64,
    feature_request_id: String,
    plan: Option<String>,
    outcome: String,
    max_iterations: u32,
    states: String,
    final_snapshot_id: Option<String>,
    error: Option<String>,
    started_at: String,
    ended_at: Option<String>,
}

impl AttemptRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            factory_id: row.get(1)?,
            feature_request_id: row.get(2)?,
            plan: row.get(3)?,
            outcome: row.get(4)?,
            max_iterations: row.get(5)?,
            states: row.get(6)?,
            final_snapshot_id: row.get(7)?,
            error: row.get(8)?,
            started_at: row.get(9)?,
            ended_at: row.get(10)?,
        })
    }

    fn into_attempt(self, iterations: Vec<BuildIteration>) -> Result<BuildAttempt> {
        let plan: Option<ImplementationPlan> = self
            .plan
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse plan JSON")?;
        let outcome = Outcome::from_str(&self.outcome)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse attempt outcome")?;
        let states: Vec<BuildState> =
            serde_json::from_str(&self.states).context("Failed to parse states JSON")?;
        BuildAttempt::from_parts(
            parse_uuid(&self.id)?,
            self.factory_id,
            parse_uuid(&self.feature_request_id)?,
            plan,
            iterations,
            outcome,
            self.max_iterations,
            states,
            parse_snapshot_id(self.final_snapshot_id)?,
            self.error,
            parse_time(&self.started_at)?,
            self.ended_at.as_deref().map(parse_time).transpose()?,
        )
        .context("Stored iterations are inconsistent")
    }
}

struct AttemptSummaryRow {
    id: String,
    factory_id: i64,
    feature_request_id: String,
    description: String,
    outcome: String,
    states: String,
    iteration_count: u32,
    max_iterations: u32,
    final_snapshot_id: Option<String>,
    error: Option<String>,
    started_at: String,
    ended_at: Option<String>,
}

impl AttemptSummaryRow {
    fn into_summary(self) -> Result<AttemptSummary> {
        let outcome = Outcome::from_str(&self.outcome)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse attempt outcome")?;
        let states: Vec<BuildState> =
            serde_json::from_str(&self.states).context("Failed to parse states JSON")?;
        Ok(AttemptSummary {
            id: parse_uuid(&self.id)?,
            factory_id: self.factory_id,
            feature_request_id: parse_uuid(&self.feature_request_id)?,
            description: self.description,
            outcome,
            state: states.last().copied(),
            iteration_count: self.iteration_count,
            max_iterations: self.max_iterations,
            final_snapshot_id: parse_snapshot_id(self.final_snapshot_id)?,
            error: self.error,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

struct EscalationRow {
    id: i64,
    attempt_id: String,
    factory_id: i64,
    feature_request_id: String,
    iteration_count: u32,
    final_diagnostics: String,
    snapshot_id: Option<String>,
    artifact_path: String,
    created_at: String,
}

impl EscalationRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            attempt_id: row.get(1)?,
            factory_id: row.get(2)?,
            feature_request_id: row.get(3)?,
            iteration_count: row.get(4)?,
            final_diagnostics: row.get(5)?,
            snapshot_id: row.get(6)?,
            artifact_path: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<EscalationRecord> {
        Ok(EscalationRecord {
            id: self.id,
            attempt_id: parse_uuid(&self.attempt_id)?,
            factory_id: self.factory_id,
            feature_request_id: parse_uuid(&self.feature_request_id)?,
            iteration_count: self.iteration_count,
            final_diagnostics: serde_json::from_str(&self.final_diagnostics)
                .context("Failed to parse final diagnostics JSON")?,
            snapshot_id: parse_snapshot_id(self.snapshot_id)?,
            artifact_path: self.artifact_path,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
