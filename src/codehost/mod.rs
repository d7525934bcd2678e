//! Code-hosting collaborator.
//!
//! Workers talk to the hosting platform only through [`CodeHost`]. Commit
//! statuses and PR comments are reporting, not control flow: callers go
//! through [`best_effort`] so a failed call is logged and never fails a
//! phase.

pub mod github;

use std::future::Future;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::CodeHostError;

pub use github::GitHubClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn default_branch(&self, repo: &str) -> Result<String, CodeHostError>;

    /// Commit sha at the tip of `branch`.
    async fn head_sha(&self, repo: &str, branch: &str) -> Result<String, CodeHostError>;

    /// Create `branch` at `from_sha`. An existing branch is not an error.
    async fn create_branch(
        &self,
        repo: &str,
        branch: &str,
        from_sha: &str,
    ) -> Result<(), CodeHostError>;

    /// Commit one file on top of `branch`, returning the new commit sha.
    async fn commit_file(
        &self,
        repo: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<String, CodeHostError>;

    /// Open a pull request, or return the open one for the same head.
    async fn open_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<i64, CodeHostError>;

    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        state: CommitState,
        context: &str,
        description: &str,
    ) -> Result<(), CodeHostError>;

    async fn comment(&self, repo: &str, pr_number: i64, body: &str) -> Result<(), CodeHostError>;
}

/// Await a reporting call, logging instead of propagating its failure.
pub async fn best_effort<T, F>(what: &str, call: F) -> Option<T>
where
    F: Future<Output = Result<T, CodeHostError>>,
{
    match call.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} failed (ignored): {}", what, e);
            None
        }
    }
}

/// Split an `owner/name` slug.
pub fn split_repo(repo: &str) -> Result<(&str, &str), CodeHostError> {
    match repo.trim().split_once('/') {
        Some((owner, name))
            if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((owner, name))
        }
        _ => Err(CodeHostError::InvalidRepo(repo.to_string())),
    }
}
