//! Run submission: validate a request, persist the run and queue it for
//! the driver.

use anyhow::{Result, bail};
use baton_common::{JobPayload, NewEvent, NewJob, NewRun, QueueName, Run, RunStatus};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::store::{Batch, DbHandle};

pub async fn submit_run(db: &DbHandle, request: NewRun, max_iterations: u32) -> Result<Run> {
    if request.repo.trim().is_empty() {
        bail!("A run needs a target repository");
    }
    if request.description.trim().is_empty() {
        bail!("A run needs a description");
    }

    let run = Run::new(Uuid::new_v4(), request, max_iterations);
    let mut batch = Batch::default();
    batch.event(
        NewEvent::new("run:queued")
            .status(RunStatus::Queued.as_str())
            .payload(json!({
                "repo": run.repo,
                "branch": run.branch,
                "source": run.source,
                "signals": run.signals,
                "max_iterations": run.max_iterations,
            })),
    );
    batch.enqueue(NewJob::new(QueueName::Runs, JobPayload::for_run(run.id)));

    let stored = run.clone();
    db.call(move |db| db.insert_run(&stored, batch)).await?;
    info!(run_id = %run.id, repo = %run.repo, "run submitted");
    Ok(run)
}
