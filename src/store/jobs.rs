//! Durable at-least-once job queue stored next to the runs.
//!
//! A job moves `ready → leased → done`. A failed delivery goes back to
//! `ready` after a backoff while attempts remain and to `dead` otherwise.
//! A lease that expires without an ack makes the job claimable again, and
//! that redelivery counts as an attempt. When the expired lease was the
//! final attempt the job dies and its run is parked for a human.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use baton_common::{
    Job, NewEvent, NewJob, Phase, QueueName, RunStatus, StageStatus, TaskStatus, Transition,
    set_role_status,
};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::db::{RunDb, insert_event, read_run, write_run};

pub const LEASE_EXPIRED: &str = "lease expired on final attempt";

/// What the queue should do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Redeliver after the delay if attempts remain.
    After(Duration),
    /// Never redeliver.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Retrying { attempt: u32, max_attempts: u32 },
    Dead,
}

/// Summary row used by inspection commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub id: i64,
    pub queue: QueueName,
    pub state: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

pub(super) fn insert_job(conn: &Connection, job: &NewJob, max_attempts: u32) -> Result<i64> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO jobs (queue, run_id, payload, state, attempts, max_attempts, available_at,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, 'ready', 0, ?4, ?5, ?6, ?6)",
        params![
            job.queue.as_str(),
            job.payload.run_id.to_string(),
            serde_json::to_string(&job.payload)?,
            max_attempts,
            now.timestamp_millis(),
            now.to_rfc3339(),
        ],
    )
    .with_context(|| format!("Failed to enqueue {} job", job.queue))?;
    Ok(conn.last_insert_rowid())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Pause the run a dead final delivery was working on, so an unblock can
/// pick it up again. Runs that already moved on are left alone.
fn park_abandoned_run(
    conn: &Connection,
    queue: QueueName,
    job_id: i64,
    run_id: Uuid,
) -> Result<()> {
    let Some(mut run) = read_run(conn, run_id)? else {
        return Ok(());
    };
    let event = match queue.stage() {
        Some(stage) => {
            let owned = run.active_delivery.is_some_and(|d| d.job_id == job_id)
                && run.phase == stage.phase()
                && run.stages.get(stage) == StageStatus::Running;
            if !owned {
                return Ok(());
            }
            run.stages.set(stage, StageStatus::Blocked);
            set_role_status(&mut run.tasks, stage.role(), TaskStatus::Blocked);
            NewEvent::new(format!("{}:failed", stage))
        }
        None => {
            let driving = !run.status.is_terminal()
                && run.status != RunStatus::AwaitingUnblock
                && matches!(run.phase, Phase::Intake | Phase::Plan);
            if !driving {
                return Ok(());
            }
            NewEvent::new("orchestrator:failed")
        }
    };

    let node = run.current_node;
    run.active_delivery = None;
    run.escalated = false;
    run.blocked_reason = Some(LEASE_EXPIRED.to_string());
    run.last_error = Some(LEASE_EXPIRED.to_string());
    run.record(
        node,
        Transition::Blocked,
        RunStatus::AwaitingUnblock,
        Some(LEASE_EXPIRED.to_string()),
    );
    run.updated_at = Utc::now();
    write_run(conn, &run)?;
    insert_event(
        conn,
        run_id,
        &event
            .node(node.as_str())
            .status(RunStatus::AwaitingUnblock.as_str())
            .reason(LEASE_EXPIRED)
            .payload(json!({ "job_id": job_id })),
    )?;
    warn!(%run_id, job_id, queue = %queue, "final delivery lost its lease, run paused");
    Ok(())
}

impl RunDb {
    /// Enqueue a job outside any run transaction.
    pub fn enqueue(&self, job: &NewJob) -> Result<i64> {
        insert_job(&self.conn, job, self.max_attempts)
    }

    /// Lease the oldest deliverable job on `queue`.
    pub fn claim_job(&self, queue: QueueName, lease: Duration) -> Result<Option<Job>> {
        self.claim_job_at(queue, lease, now_ms())
    }

    pub(crate) fn claim_job_at(
        &self,
        queue: QueueName,
        lease: Duration,
        now: i64,
    ) -> Result<Option<Job>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin claim transaction")?;

        // An expired lease on the final attempt has no delivery left.
        let expired = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, run_id FROM jobs
                     WHERE queue = ?1 AND state = 'leased' AND leased_until <= ?2
                       AND attempts >= max_attempts",
                )
                .context("Failed to prepare lease expiry")?;
            let rows = stmt
                .query_map(params![queue.as_str(), now], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .context("Failed to query expired leases")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read expired lease")?
        };
        for (job_id, run_id) in expired {
            tx.execute(
                "UPDATE jobs SET state = 'dead', leased_until = NULL,
                     last_error = COALESCE(last_error, ?2), updated_at = ?3
                 WHERE id = ?1",
                params![job_id, LEASE_EXPIRED, Utc::now().to_rfc3339()],
            )
            .context("Failed to expire lease")?;
            let run_id = Uuid::parse_str(&run_id).context("Invalid job run id")?;
            park_abandoned_run(&tx, queue, job_id, run_id)?;
        }

        let candidate = tx
            .query_row(
                "SELECT id, payload, attempts, max_attempts FROM jobs
                 WHERE queue = ?1
                   AND ((state = 'ready' AND available_at <= ?2)
                     OR (state = 'leased' AND leased_until <= ?2))
                 ORDER BY id LIMIT 1",
                params![queue.as_str(), now],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to select job")?;

        let Some((id, payload, attempts, max_attempts)) = candidate else {
            tx.commit().context("Failed to commit claim")?;
            return Ok(None);
        };

        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        tx.execute(
            "UPDATE jobs SET state = 'leased', attempts = attempts + 1,
                 leased_until = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, now.saturating_add(lease_ms), Utc::now().to_rfc3339()],
        )
        .context("Failed to lease job")?;
        tx.commit().context("Failed to commit claim")?;

        Ok(Some(Job {
            id,
            queue,
            payload: serde_json::from_str(&payload).context("Invalid job payload")?,
            attempt: attempts + 1,
            max_attempts,
        }))
    }

    /// Acknowledge a successful delivery.
    pub fn complete_job(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE jobs SET state = 'done', leased_until = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .context("Failed to complete job")?;
        Ok(())
    }

    /// Record a failed delivery and decide whether it will be redelivered.
    pub fn fail_job(&self, id: i64, error: &str, retry: Retry) -> Result<JobDisposition> {
        self.fail_job_at(id, error, retry, now_ms())
    }

    pub(crate) fn fail_job_at(
        &self,
        id: i64,
        error: &str,
        retry: Retry,
        now: i64,
    ) -> Result<JobDisposition> {
        let (attempts, max_attempts) = self
            .conn
            .query_row(
                "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()
            .context("Failed to read job")?
            .ok_or_else(|| anyhow!("Job {} not found", id))?;

        let disposition = match retry {
            Retry::After(delay) if attempts < max_attempts => {
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                self.conn
                    .execute(
                        "UPDATE jobs SET state = 'ready', leased_until = NULL,
                             available_at = ?2, last_error = ?3, updated_at = ?4
                         WHERE id = ?1",
                        params![
                            id,
                            now.saturating_add(delay_ms),
                            error,
                            Utc::now().to_rfc3339()
                        ],
                    )
                    .context("Failed to reschedule job")?;
                JobDisposition::Retrying {
                    attempt: attempts,
                    max_attempts,
                }
            }
            _ => {
                self.conn
                    .execute(
                        "UPDATE jobs SET state = 'dead', leased_until = NULL,
                             last_error = ?2, updated_at = ?3
                         WHERE id = ?1",
                        params![id, error, Utc::now().to_rfc3339()],
                    )
                    .context("Failed to dead-letter job")?;
                JobDisposition::Dead
            }
        };
        Ok(disposition)
    }

    pub fn count_jobs(&self, queue: QueueName, state: &str) -> Result<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND state = ?2",
                params![queue.as_str(), state],
                |row| row.get::<_, i64>(0),
            )
            .context("Failed to count jobs")?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub fn list_jobs(&self, run_id: Uuid) -> Result<Vec<JobSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, queue, state, attempts, max_attempts, last_error
                 FROM jobs WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            let (id, queue, state, attempts, max_attempts, last_error) =
                row.context("Failed to read job row")?;
            jobs.push(JobSummary {
                id,
                queue: queue.parse().map_err(|e: String| anyhow!(e))?,
                state,
                attempts,
                max_attempts,
                last_error,
            });
        }
        Ok(jobs)
    }
}
