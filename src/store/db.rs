use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use baton_common::{Event, NewEvent, NewJob, Run};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::jobs::insert_job;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Events and jobs written in the same transaction as a run mutation.
#[derive(Debug, Default)]
pub struct Batch {
    events: Vec<NewEvent>,
    jobs: Vec<NewJob>,
}

impl Batch {
    pub fn event(&mut self, event: NewEvent) {
        self.events.push(event);
    }

    pub fn enqueue(&mut self, job: NewJob) {
        self.jobs.push(job);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.jobs.is_empty()
    }

    pub fn events(&self) -> &[NewEvent] {
        &self.events
    }

    pub fn jobs(&self) -> &[NewJob] {
        &self.jobs
    }
}

pub struct RunDb {
    pub(super) conn: Connection,
    pub(super) max_attempts: u32,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self {
            conn,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        };
        db.init()?;
        Ok(db)
    }

    /// Attempt ceiling stamped on every job enqueued from now on.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    repo TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    title TEXT,
                    description TEXT NOT NULL,
                    source TEXT NOT NULL,
                    plan_summary TEXT,
                    status TEXT NOT NULL,
                    phase TEXT NOT NULL,
                    current_node TEXT NOT NULL,
                    retries TEXT NOT NULL,
                    tasks TEXT NOT NULL DEFAULT '[]',
                    iteration INTEGER NOT NULL,
                    max_iterations INTEGER NOT NULL,
                    history TEXT NOT NULL DEFAULT '[]',
                    signals TEXT NOT NULL,
                    stages TEXT NOT NULL,
                    pr_number INTEGER,
                    blocked_reason TEXT,
                    escalated INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    active_delivery TEXT
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    event_type TEXT NOT NULL,
                    node TEXT,
                    status TEXT,
                    reason TEXT,
                    payload TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    queue TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'ready',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    available_at INTEGER NOT NULL,
                    leased_until INTEGER,
                    last_error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, id);
                CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, state, available_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs(run_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Insert a new run together with its initial events and jobs.
    pub fn insert_run(&self, run: &Run, batch: Batch) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        write_run(&tx, run)?;
        write_batch(&tx, run.id, &batch, self.max_attempts)?;
        tx.commit().context("Failed to commit run insert")?;
        Ok(())
    }

    pub fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        read_run(&self.conn, id)
    }

    /// Most recently created runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM runs ORDER BY created_at DESC LIMIT ?1",
                RUN_COLUMNS
            ))
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![limit as i64], RunRow::from_row)
            .context("Failed to query runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// Atomic read-modify-write of one run.
    ///
    /// Loads the run, lets `f` mutate it and queue events/jobs, then writes
    /// the run, the events and the jobs in a single transaction. Returns
    /// `Ok(None)` when the run does not exist. An error from `f` rolls
    /// everything back. Nothing is written when `f` leaves the run unchanged
    /// and queues nothing.
    pub fn transact<T, F>(&self, id: Uuid, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Run, &mut Batch) -> Result<T>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let Some(mut run) = read_run(&tx, id)? else {
            return Ok(None);
        };
        let before = run.clone();
        let mut batch = Batch::default();
        let value = f(&mut run, &mut batch)?;

        if run != before || !batch.is_empty() {
            if run != before {
                run.updated_at = Utc::now();
            }
            write_run(&tx, &run)?;
            write_batch(&tx, id, &batch, self.max_attempts)?;
        }
        tx.commit().context("Failed to commit run transaction")?;
        Ok(Some(value))
    }

    // ── Events ────────────────────────────────────────────────────────

    pub fn append_event(&self, run_id: Uuid, event: &NewEvent) -> Result<i64> {
        insert_event(&self.conn, run_id, event)
    }

    pub fn list_events(&self, run_id: Uuid) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, event_type, node, status, reason, payload, created_at
                 FROM events WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    event_type: row.get(2)?,
                    node: row.get(3)?,
                    status: row.get(4)?,
                    reason: row.get(5)?,
                    payload: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?.into_event()?);
        }
        Ok(events)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

const RUN_COLUMNS: &str = "id, repo, branch, title, description, source, plan_summary, status, \
     phase, current_node, retries, tasks, iteration, max_iterations, history, signals, stages, \
     pr_number, blocked_reason, escalated, last_error, created_at, updated_at, started_at, \
     completed_at, active_delivery";

struct RunRow {
    id: String,
    repo: String,
    branch: String,
    title: Option<String>,
    description: String,
    source: String,
    plan_summary: Option<String>,
    status: String,
    phase: String,
    current_node: String,
    retries: String,
    tasks: String,
    iteration: i64,
    max_iterations: i64,
    history: String,
    signals: String,
    stages: String,
    pr_number: Option<i64>,
    blocked_reason: Option<String>,
    escalated: bool,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    active_delivery: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo: row.get(1)?,
            branch: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            source: row.get(5)?,
            plan_summary: row.get(6)?,
            status: row.get(7)?,
            phase: row.get(8)?,
            current_node: row.get(9)?,
            retries: row.get(10)?,
            tasks: row.get(11)?,
            iteration: row.get(12)?,
            max_iterations: row.get(13)?,
            history: row.get(14)?,
            signals: row.get(15)?,
            stages: row.get(16)?,
            pr_number: row.get(17)?,
            blocked_reason: row.get(18)?,
            escalated: row.get(19)?,
            last_error: row.get(20)?,
            created_at: row.get(21)?,
            updated_at: row.get(22)?,
            started_at: row.get(23)?,
            completed_at: row.get(24)?,
            active_delivery: row.get(25)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: Uuid::parse_str(&self.id).context("Invalid run id")?,
            repo: self.repo,
            branch: self.branch,
            title: self.title,
            description: self.description,
            source: self.source,
            plan_summary: self.plan_summary,
            status: parse_enum(&self.status)?,
            phase: parse_enum(&self.phase)?,
            current_node: parse_enum(&self.current_node)?,
            retries: serde_json::from_str(&self.retries).context("Invalid retries json")?,
            tasks: serde_json::from_str(&self.tasks).context("Invalid tasks json")?,
            iteration: u32::try_from(self.iteration).context("Invalid iteration")?,
            max_iterations: u32::try_from(self.max_iterations)
                .context("Invalid max_iterations")?,
            history: serde_json::from_str(&self.history).context("Invalid history json")?,
            signals: serde_json::from_str(&self.signals).context("Invalid signals json")?,
            stages: serde_json::from_str(&self.stages).context("Invalid stages json")?,
            pr_number: self.pr_number,
            blocked_reason: self.blocked_reason,
            escalated: self.escalated,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            active_delivery: self
                .active_delivery
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid active_delivery json")?,
        })
    }
}

struct EventRow {
    id: i64,
    run_id: String,
    event_type: String,
    node: Option<String>,
    status: Option<String>,
    reason: Option<String>,
    payload: String,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: self.id,
            run_id: Uuid::parse_str(&self.run_id).context("Invalid event run id")?,
            event_type: self.event_type,
            node: self.node,
            status: self.status,
            reason: self.reason,
            payload: serde_json::from_str(&self.payload).context("Invalid event payload")?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn parse_enum<T: FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse::<T>().map_err(|e| anyhow!(e))
}

pub(super) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

pub(super) fn read_run(conn: &Connection, id: Uuid) -> Result<Option<Run>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
            params![id.to_string()],
            RunRow::from_row,
        )
        .optional()
        .context("Failed to query run")?;
    row.map(RunRow::into_run).transpose()
}

pub(super) fn write_run(conn: &Connection, run: &Run) -> Result<()> {
    conn.execute(
        "INSERT INTO runs (id, repo, branch, title, description, source, plan_summary, status,
             phase, current_node, retries, tasks, iteration, max_iterations, history, signals,
             stages, pr_number, blocked_reason, escalated, last_error, created_at, updated_at,
             started_at, completed_at, active_delivery)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
         ON CONFLICT(id) DO UPDATE SET
             repo = excluded.repo,
             branch = excluded.branch,
             title = excluded.title,
             description = excluded.description,
             source = excluded.source,
             plan_summary = excluded.plan_summary,
             status = excluded.status,
             phase = excluded.phase,
             current_node = excluded.current_node,
             retries = excluded.retries,
             tasks = excluded.tasks,
             iteration = excluded.iteration,
             max_iterations = excluded.max_iterations,
             history = excluded.history,
             signals = excluded.signals,
             stages = excluded.stages,
             pr_number = excluded.pr_number,
             blocked_reason = excluded.blocked_reason,
             escalated = excluded.escalated,
             last_error = excluded.last_error,
             updated_at = excluded.updated_at,
             started_at = excluded.started_at,
             completed_at = excluded.completed_at,
             active_delivery = excluded.active_delivery",
        params![
            run.id.to_string(),
            run.repo,
            run.branch,
            run.title,
            run.description,
            run.source,
            run.plan_summary,
            run.status.as_str(),
            run.phase.as_str(),
            run.current_node.as_str(),
            serde_json::to_string(&run.retries)?,
            serde_json::to_string(&run.tasks)?,
            run.iteration as i64,
            run.max_iterations as i64,
            serde_json::to_string(&run.history)?,
            serde_json::to_string(&run.signals)?,
            serde_json::to_string(&run.stages)?,
            run.pr_number,
            run.blocked_reason,
            run.escalated,
            run.last_error,
            run.created_at.to_rfc3339(),
            run.updated_at.to_rfc3339(),
            run.started_at.map(|t| t.to_rfc3339()),
            run.completed_at.map(|t| t.to_rfc3339()),
            run.active_delivery
                .map(|d| serde_json::to_string(&d))
                .transpose()?,
        ],
    )
    .context("Failed to write run")?;
    Ok(())
}

pub(super) fn insert_event(conn: &Connection, run_id: Uuid, event: &NewEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (run_id, event_type, node, status, reason, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run_id.to_string(),
            event.event_type,
            event.node,
            event.status,
            event.reason,
            serde_json::to_string(&event.payload)?,
            Utc::now().to_rfc3339(),
        ],
    )
    .with_context(|| format!("Failed to append event {}", event.event_type))?;
    Ok(conn.last_insert_rowid())
}

fn write_batch(conn: &Connection, run_id: Uuid, batch: &Batch, max_attempts: u32) -> Result<()> {
    for event in &batch.events {
        insert_event(conn, run_id, event)?;
    }
    for job in &batch.jobs {
        insert_job(conn, job, max_attempts)?;
    }
    Ok(())
}
