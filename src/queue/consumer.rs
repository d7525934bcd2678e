use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use baton_common::Job;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::JobHandler;
use crate::config::QueueSection;
use crate::errors::panic_message;
use crate::store::{DbHandle, JobDisposition, Retry};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub backoff: Duration,
}

impl ConsumerSettings {
    pub fn from_config(queues: &QueueSection) -> Self {
        Self {
            concurrency: queues.concurrency.max(1),
            poll_interval: queues.poll_interval(),
            lease: queues.lease(),
            backoff: queues.backoff(),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from_config(&QueueSection::default())
    }
}

/// Polls one queue and runs its handler on up to `concurrency` jobs at once.
pub struct QueueConsumer {
    db: DbHandle,
    handler: Arc<dyn JobHandler>,
    settings: ConsumerSettings,
}

impl QueueConsumer {
    pub fn new(db: DbHandle, handler: Arc<dyn JobHandler>, settings: ConsumerSettings) -> Self {
        Self {
            db,
            handler,
            settings,
        }
    }

    /// Consume until `cancel` fires, then wait for in-flight jobs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let queue = self.handler.queue();
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        info!(queue = %queue, concurrency = self.settings.concurrency, "consumer started");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(queue = %queue, "job task failed to join: {}", e);
                }
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.context("Consumer semaphore closed")?
                }
            };

            let claimed = match self.claim().await {
                Ok(job) => job,
                Err(e) => {
                    warn!(queue = %queue, "Failed to claim job: {:#}", e);
                    None
                }
            };

            match claimed {
                Some(job) => {
                    let db = self.db.clone();
                    let handler = self.handler.clone();
                    let backoff = self.settings.backoff;
                    in_flight.spawn(async move {
                        let _permit = permit;
                        process(&db, handler.as_ref(), job, backoff).await;
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }

        info!(queue = %queue, in_flight = in_flight.len(), "consumer stopping");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(queue = %queue, "job task failed to join: {}", e);
            }
        }
        Ok(())
    }

    /// Claim and process at most one job. Returns whether one was processed.
    pub async fn run_once(&self) -> Result<bool> {
        match self.claim().await? {
            Some(job) => {
                process(&self.db, self.handler.as_ref(), job, self.settings.backoff).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn claim(&self) -> Result<Option<Job>> {
        let queue = self.handler.queue();
        let lease = self.settings.lease;
        self.db.call(move |db| db.claim_job(queue, lease)).await
    }
}

/// Run the handler for one delivery and settle it with the queue.
async fn process(db: &DbHandle, handler: &dyn JobHandler, job: Job, backoff: Duration) {
    let job_id = job.id;
    debug!(job_id, queue = %job.queue, attempt = job.attempt, run_id = %job.payload.run_id, "processing job");

    let outcome = AssertUnwindSafe(handler.handle(&job)).catch_unwind().await;
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            let retry = if e.is_fatal() {
                Retry::Never
            } else {
                Retry::After(backoff)
            };
            Some((e.to_string(), retry))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(job_id, "job handler panicked: {}", message);
            Some((format!("handler panicked: {}", message), Retry::After(backoff)))
        }
    };

    let settled = match failure {
        None => db.call(move |db| db.complete_job(job_id)).await,
        Some((error, retry)) => {
            let logged = error.clone();
            match db.call(move |db| db.fail_job(job_id, &error, retry)).await {
                Ok(JobDisposition::Retrying {
                    attempt,
                    max_attempts,
                }) => {
                    warn!(job_id, attempt, max_attempts, "job failed, will retry: {}", logged);
                    Ok(())
                }
                Ok(JobDisposition::Dead) => {
                    error!(job_id, attempt = job.attempt, "job dead-lettered: {}", logged);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    };
    if let Err(e) = settled {
        // The lease will expire and the job will be redelivered.
        error!(job_id, "Failed to settle job: {:#}", e);
    }
}
