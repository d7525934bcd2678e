//! Typed error hierarchy for Baton.
//!
//! - `WorkflowError`: graph executor failures
//! - `WorkerError`: phase worker job failures, classified for queue accounting
//! - `PhaseError`: failures of a stage's external work
//! - `CodeHostError`: code-hosting API failures

use baton_common::{NodeName, Stage};
use thiserror::Error;

/// Errors from one executor invocation.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Failed to persist {transition} step for node {node}: {source}")]
    StepPersistence {
        node: NodeName,
        transition: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced to the queue consumer by a job handler.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Policy violation. Never retried by the queue; needs a human unblock.
    #[error("Repo not allowed ({stage}): {repo}")]
    RepoNotAllowed { stage: Stage, repo: String },

    /// The stage's work failed; the queue's attempt budget decides redelivery.
    #[error("{stage} failed: {reason}")]
    PhaseFailed { stage: Stage, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkerError {
    /// Fatal errors must not be redelivered by the queue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RepoNotAllowed { .. })
    }
}

/// Errors from a stage's external work.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Missing credential: {0}")]
    MissingCredentials(String),

    #[error("Command timed out after {secs}s")]
    TimedOut { secs: u64, output: String },

    #[error("Command failed to start: {0}")]
    Command(#[source] std::io::Error),

    #[error("Stage work panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    CodeHost(#[from] CodeHostError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PhaseError {
    pub fn is_missing_secret(&self) -> bool {
        matches!(
            self,
            Self::MissingCredentials(_) | Self::CodeHost(CodeHostError::Unauthorized { .. })
        )
    }

    /// Output captured before the failure, if any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::TimedOut { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Errors from the code-hosting client.
#[derive(Debug, Error)]
pub enum CodeHostError {
    #[error("Invalid repository slug '{0}', expected owner/name")]
    InvalidRepo(String),

    #[error("Code host rejected credentials ({status}) for {action}")]
    Unauthorized { action: String, status: u16 },

    #[error("Code host returned {status} for {action}: {message}")]
    Api {
        action: String,
        status: u16,
        message: String,
    },

    #[error("Code host request failed for {action}: {source}")]
    Transport {
        action: String,
        #[source]
        source: reqwest::Error,
    },
}
