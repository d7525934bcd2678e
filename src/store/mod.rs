//! SQLite-backed run store and job queue.
//!
//! Runs, their audit events and queued jobs share one database so that a
//! run mutation, its events and the jobs it hands off commit together.

pub mod db;
pub mod jobs;

use std::sync::Arc;

use anyhow::{Context, Result};
use baton_common::Run;
use uuid::Uuid;

pub use db::{Batch, DEFAULT_MAX_ATTEMPTS, RunDb};
pub use jobs::{JobDisposition, JobSummary, Retry};

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, RunDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        self.call(move |db| db.get_run(id)).await
    }

    /// Async form of [`RunDb::transact`].
    pub async fn transact<T, F>(&self, id: Uuid, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut Run, &mut Batch) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call(move |db| db.transact(id, f)).await
    }
}
