//! Persisted run and phase state.
//!
//! `StateStore` is the create/update/query contract the orchestrator needs;
//! `SqliteStore` implements it on SQLite. Every phase transition runs inside a
//! transaction, so a crash leaves the last committed state. The `done` and
//! `progress` subcommands open the same database from the worker's process,
//! which is why the connection waits on locks instead of failing.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::compliance::{CompletionReport, CompletionSignal, SignalStatus};
use crate::gates::GateResult;
use crate::phase::PhaseStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => anyhow::bail!("Invalid run status '{}'", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: i64,
    pub plan_path: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: RunStatus,
}

/// One attempt of one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseExecution {
    pub id: i64,
    pub run_id: i64,
    pub phase_id: String,
    pub attempt: u32,
    pub status: PhaseStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub log_path: Option<String>,
    /// Human-readable reason for the terminal state
    pub error: Option<String>,
    pub restarts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateRecord {
    pub gate_name: String,
    pub passed: bool,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestartRecord {
    pub seq: u32,
    pub reason: String,
    /// Serialized checkpoint snapshot
    pub checkpoint: String,
    pub created_at: String,
}

/// Storage contract for run and phase state.
pub trait StateStore: Send {
    fn create_run(&self, plan_path: &str) -> Result<i64>;
    fn finish_run(&self, run_id: i64, status: RunStatus) -> Result<()>;
    fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>>;
    fn latest_run(&self) -> Result<Option<RunRecord>>;

    /// Open a `running` execution row for a new attempt.
    fn start_attempt(
        &self,
        run_id: i64,
        phase_id: &str,
        attempt: u32,
        log_path: Option<&str>,
    ) -> Result<i64>;
    /// Record a phase state change. Terminal states also stamp `completed_at`.
    fn transition(&self, execution_id: i64, status: PhaseStatus, reason: Option<&str>)
    -> Result<()>;
    fn record_gate_results(&self, execution_id: i64, results: &[GateResult]) -> Result<()>;
    fn record_restart(
        &self,
        execution_id: i64,
        seq: u32,
        reason: &str,
        checkpoint: &str,
    ) -> Result<()>;

    fn record_signal(
        &self,
        run_id: i64,
        phase_id: &str,
        status: SignalStatus,
        reason: Option<&str>,
        report: Option<&CompletionReport>,
    ) -> Result<i64>;
    /// Highest signal id so far (0 when none), used to scope signals to an attempt.
    fn last_signal_id(&self) -> Result<i64>;
    /// Most recent signal for the phase with an id above `after_id`.
    fn latest_signal_after(
        &self,
        run_id: i64,
        phase_id: &str,
        after_id: i64,
    ) -> Result<Option<CompletionSignal>>;

    fn get_execution(&self, execution_id: i64) -> Result<Option<PhaseExecution>>;
    /// Latest execution of each phase in a run, in execution order.
    fn latest_executions(&self, run_id: i64) -> Result<Vec<PhaseExecution>>;
    /// Every execution of a phase across all runs, oldest first.
    fn phase_history(&self, phase_id: &str) -> Result<Vec<PhaseExecution>>;
    fn gate_results(&self, execution_id: i64) -> Result<Vec<GateRecord>>;
    fn restart_events(&self, execution_id: i64) -> Result<Vec<RestartRecord>>;
    /// Phases whose most recent execution under `plan_path` completed.
    fn completed_phases(&self, plan_path: &str) -> Result<HashSet<String>>;
}

/// Async-safe handle to the state store.
///
/// Runs every call on tokio's blocking pool via `spawn_blocking`, so SQLite
/// I/O never stalls the worker session's event loop.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<Box<dyn StateStore>>>,
}

impl StoreHandle {
    pub fn new(store: impl StateStore + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&dyn StateStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&**guard)
        })
        .await
        .context("Store task panicked")?
    }

    /// Access the store synchronously. For CLI commands and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn StateStore>>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }
}

pub struct SqliteStore {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

const EXECUTION_COLUMNS: &str =
    "id, run_id, phase_id, attempt, status, started_at, completed_at, log_path, error, restarts";

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open state database {}", path.display()))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plan_path TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                status TEXT NOT NULL DEFAULT 'running'
            );

            CREATE TABLE IF NOT EXISTS phase_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                phase_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                log_path TEXT,
                error TEXT,
                restarts INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS gate_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phase_execution_id INTEGER NOT NULL REFERENCES phase_executions(id) ON DELETE CASCADE,
                gate_name TEXT NOT NULL,
                passed INTEGER NOT NULL,
                output TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS completion_signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                phase_id TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                report TEXT,
                signaled_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS restart_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phase_execution_id INTEGER NOT NULL REFERENCES phase_executions(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                reason TEXT NOT NULL,
                checkpoint TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_executions_run ON phase_executions(run_id);
            CREATE INDEX IF NOT EXISTS idx_executions_phase ON phase_executions(phase_id);
            CREATE INDEX IF NOT EXISTS idx_signals_phase ON completion_signals(run_id, phase_id);
            ",
        )?;
        Ok(())
    }

    fn query_executions(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PhaseExecution>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare execution query")?;
        let rows = stmt
            .query_map(params, ExecutionRow::from_row)
            .context("Failed to query phase executions")?;
        let mut executions = Vec::new();
        for row in rows {
            let row = row.context("Failed to read phase_executions row")?;
            executions.push(row.into_execution()?);
        }
        Ok(executions)
    }
}

impl StateStore for SqliteStore {
    fn create_run(&self, plan_path: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO runs (plan_path, started_at, status) VALUES (?1, ?2, 'running')",
                params![plan_path, now()],
            )
            .context("Failed to insert run")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn finish_run(&self, run_id: i64, status: RunStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status.as_str(), now(), run_id],
            )
            .context("Failed to update run")?;
        Ok(())
    }

    fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, plan_path, started_at, completed_at, status FROM runs WHERE id = ?1",
                params![run_id],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    fn latest_run(&self) -> Result<Option<RunRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, plan_path, started_at, completed_at, status FROM runs ORDER BY id DESC LIMIT 1",
                [],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query latest run")?;
        row.map(RunRow::into_run).transpose()
    }

    fn start_attempt(
        &self,
        run_id: i64,
        phase_id: &str,
        attempt: u32,
        log_path: Option<&str>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO phase_executions (run_id, phase_id, attempt, status, started_at, log_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    phase_id,
                    attempt,
                    PhaseStatus::Running.as_str(),
                    now(),
                    log_path
                ],
            )
            .context("Failed to insert phase execution")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn transition(
        &self,
        execution_id: i64,
        status: PhaseStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let updated = if status.is_terminal() {
            tx.execute(
                "UPDATE phase_executions SET status = ?1, error = ?2, completed_at = ?3 WHERE id = ?4",
                params![status.as_str(), reason, now(), execution_id],
            )
        } else {
            tx.execute(
                "UPDATE phase_executions SET status = ?1, error = COALESCE(?2, error) WHERE id = ?3",
                params![status.as_str(), reason, execution_id],
            )
        }
        .context("Failed to update phase execution")?;
        if updated == 0 {
            anyhow::bail!("Phase execution {} not found", execution_id);
        }
        tx.commit().context("Failed to commit transition")?;
        Ok(())
    }

    fn record_gate_results(&self, execution_id: i64, results: &[GateResult]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for result in results {
            tx.execute(
                "INSERT INTO gate_results (phase_execution_id, gate_name, passed, output) VALUES (?1, ?2, ?3, ?4)",
                params![execution_id, result.name, result.passed(), result.output],
            )
            .context("Failed to insert gate result")?;
        }
        tx.commit().context("Failed to commit gate results")?;
        Ok(())
    }

    fn record_restart(
        &self,
        execution_id: i64,
        seq: u32,
        reason: &str,
        checkpoint: &str,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO restart_events (phase_execution_id, seq, reason, checkpoint, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![execution_id, seq, reason, checkpoint, now()],
        )
        .context("Failed to insert restart event")?;
        tx.execute(
            "UPDATE phase_executions SET restarts = ?1 WHERE id = ?2",
            params![seq, execution_id],
        )
        .context("Failed to update restart count")?;
        tx.commit().context("Failed to commit restart event")?;
        Ok(())
    }

    fn record_signal(
        &self,
        run_id: i64,
        phase_id: &str,
        status: SignalStatus,
        reason: Option<&str>,
        report: Option<&CompletionReport>,
    ) -> Result<i64> {
        let report_json = report
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize completion report")?;
        self.conn
            .execute(
                "INSERT INTO completion_signals (run_id, phase_id, status, reason, report, signaled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, phase_id, status.as_str(), reason, report_json, now()],
            )
            .context("Failed to insert completion signal")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn last_signal_id(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(id), 0) FROM completion_signals",
                [],
                |row| row.get(0),
            )
            .context("Failed to query last signal id")
    }

    fn latest_signal_after(
        &self,
        run_id: i64,
        phase_id: &str,
        after_id: i64,
    ) -> Result<Option<CompletionSignal>> {
        let row: Option<(String, Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT status, reason, report FROM completion_signals
                 WHERE run_id = ?1 AND phase_id = ?2 AND id > ?3
                 ORDER BY id DESC LIMIT 1",
                params![run_id, phase_id, after_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to query completion signal")?;

        let Some((status, reason, report)) = row else {
            return Ok(None);
        };
        let status = SignalStatus::from_str(&status).context("Failed to parse signal status")?;
        let report = report
            .map(|json| serde_json::from_str::<CompletionReport>(&json))
            .transpose()
            .context("Failed to parse stored completion report")?;
        Ok(Some(CompletionSignal {
            status,
            reason,
            report,
        }))
    }

    fn get_execution(&self, execution_id: i64) -> Result<Option<PhaseExecution>> {
        let sql = format!(
            "SELECT {} FROM phase_executions WHERE id = ?1",
            EXECUTION_COLUMNS
        );
        Ok(self
            .query_executions(&sql, params![execution_id])?
            .into_iter()
            .next())
    }

    fn latest_executions(&self, run_id: i64) -> Result<Vec<PhaseExecution>> {
        let sql = format!(
            "SELECT {} FROM phase_executions WHERE id IN (
                 SELECT MAX(id) FROM phase_executions WHERE run_id = ?1 GROUP BY phase_id
             ) ORDER BY id",
            EXECUTION_COLUMNS
        );
        self.query_executions(&sql, params![run_id])
    }

    fn phase_history(&self, phase_id: &str) -> Result<Vec<PhaseExecution>> {
        let sql = format!(
            "SELECT {} FROM phase_executions WHERE phase_id = ?1 ORDER BY id",
            EXECUTION_COLUMNS
        );
        self.query_executions(&sql, params![phase_id])
    }

    fn gate_results(&self, execution_id: i64) -> Result<Vec<GateRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT gate_name, passed, output FROM gate_results WHERE phase_execution_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare gate_results query")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok(GateRecord {
                    gate_name: row.get(0)?,
                    passed: row.get(1)?,
                    output: row.get(2)?,
                })
            })
            .context("Failed to query gate results")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read gate_results row")
    }

    fn restart_events(&self, execution_id: i64) -> Result<Vec<RestartRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, reason, checkpoint, created_at FROM restart_events WHERE phase_execution_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare restart_events query")?;
        let rows = stmt
            .query_map(params![execution_id], |row| {
                Ok(RestartRecord {
                    seq: row.get(0)?,
                    reason: row.get(1)?,
                    checkpoint: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query restart events")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read restart_events row")
    }

    fn completed_phases(&self, plan_path: &str) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT pe.phase_id, pe.status FROM phase_executions pe
                 WHERE pe.id IN (
                     SELECT MAX(e.id) FROM phase_executions e
                     JOIN runs r ON r.id = e.run_id
                     WHERE r.plan_path = ?1
                     GROUP BY e.phase_id
                 )",
            )
            .context("Failed to prepare completed_phases query")?;
        let rows = stmt
            .query_map(params![plan_path], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query completed phases")?;

        let mut completed = HashSet::new();
        for row in rows {
            let (phase_id, status) = row.context("Failed to read phase_executions row")?;
            if status == PhaseStatus::Completed.as_str() {
                completed.insert(phase_id);
            }
        }
        Ok(completed)
    }
}

/// Intermediate row struct for reading runs before converting.
struct RunRow {
    id: i64,
    plan_path: String,
    started_at: String,
    completed_at: Option<String>,
    status: String,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            plan_path: row.get(1)?,
            started_at: row.get(2)?,
            completed_at: row.get(3)?,
            status: row.get(4)?,
        })
    }

    fn into_run(self) -> Result<RunRecord> {
        let status = RunStatus::from_str(&self.status).context("Failed to parse run status")?;
        Ok(RunRecord {
            id: self.id,
            plan_path: self.plan_path,
            started_at: self.started_at,
            completed_at: self.completed_at,
            status,
        })
    }
}

/// Intermediate row struct for phase_executions.
struct ExecutionRow {
    id: i64,
    run_id: i64,
    phase_id: String,
    attempt: u32,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    log_path: Option<String>,
    error: Option<String>,
    restarts: u32,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            phase_id: row.get(2)?,
            attempt: row.get(3)?,
            status: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            log_path: row.get(7)?,
            error: row.get(8)?,
            restarts: row.get(9)?,
        })
    }

    fn into_execution(self) -> Result<PhaseExecution> {
        let status =
            PhaseStatus::from_str(&self.status).context("Failed to parse phase status")?;
        Ok(PhaseExecution {
            id: self.id,
            run_id: self.run_id,
            phase_id: self.phase_id,
            attempt: self.attempt,
            status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            log_path: self.log_path,
            error: self.error,
            restarts: self.restarts,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
