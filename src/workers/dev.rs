use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{PhaseContext, PhaseReport, PhaseWork};
use crate::codehost::CodeHost;
use crate::errors::PhaseError;

/// Branch prefix for work branches, followed by `run-<short id>`.
pub const BRANCH_PREFIX: &str = "baton/";

pub fn work_branch(short_id: &str) -> String {
    format!("{}run-{}", BRANCH_PREFIX, short_id)
}

/// Opens the run's work branch and pull request on the code host.
pub struct DevWork {
    host: Option<Arc<dyn CodeHost>>,
    token_env: String,
}

impl DevWork {
    /// `host` is `None` when no credentials are configured; every delivery
    /// then fails as a missing secret.
    pub fn new(host: Option<Arc<dyn CodeHost>>, token_env: impl Into<String>) -> Self {
        Self {
            host,
            token_env: token_env.into(),
        }
    }
}

fn marker_file(ctx: &PhaseContext<'_>) -> (String, String) {
    let run = ctx.run;
    let path = format!(".baton/runs/{}.md", run.short_id());
    let mut body = format!(
        "# {}\n\nRun: {}\nIteration: {}\n\n{}\n",
        run.title.as_deref().unwrap_or("Baton run"),
        run.id,
        run.iteration,
        run.description
    );
    if let Some(plan) = &run.plan_summary {
        body.push_str(&format!("\n## Plan\n\n{}\n", plan));
    }
    (path, body)
}

#[async_trait]
impl PhaseWork for DevWork {
    async fn perform(&self, ctx: &PhaseContext<'_>) -> Result<PhaseReport, PhaseError> {
        let host = self
            .host
            .as_ref()
            .ok_or_else(|| PhaseError::MissingCredentials(self.token_env.clone()))?;
        let repo = ctx.repo;
        let branch = work_branch(&ctx.run.short_id());

        let base = host.default_branch(repo).await?;
        let base_sha = host.head_sha(repo, &base).await?;
        host.create_branch(repo, &branch, &base_sha).await?;

        let (path, content) = marker_file(ctx);
        let commit = host
            .commit_file(
                repo,
                &branch,
                &path,
                &content,
                &format!("baton: start run {}", ctx.run.short_id()),
            )
            .await?;

        let title = ctx
            .run
            .title
            .clone()
            .unwrap_or_else(|| format!("baton run {}", ctx.run.short_id()));
        let body = format!(
            "{}\n\n---\nOpened by baton for run `{}`.",
            ctx.run.description, ctx.run.id
        );
        let pr = host
            .open_pull_request(repo, &branch, &base, &title, &body)
            .await?;
        info!(run_id = %ctx.run.id, %repo, %branch, pr, "pull request ready");

        Ok(PhaseReport {
            success: true,
            output: format!(
                "Committed {} as {} on {} and opened PR #{} against {}",
                path, commit, branch, pr, base
            ),
            branch: Some(branch),
            pr_number: Some(pr),
        })
    }
}
