use std::sync::Arc;

use async_trait::async_trait;
use baton_common::Stage;
use tracing::{debug, info};

use super::{PhaseContext, PhaseReport, PhaseWork};
use crate::codehost::{CodeHost, CommitState, best_effort};
use crate::commands::{ShellRunner, truncate_output};
use crate::errors::PhaseError;

/// Characters of output quoted in a PR comment.
const COMMENT_OUTPUT_LIMIT: usize = 1000;

/// Review or ops verification: run the configured command and report the
/// result as a commit status and a PR comment.
pub struct CheckWork {
    stage: Stage,
    command: Option<String>,
    status_context: String,
    runner: ShellRunner,
    host: Option<Arc<dyn CodeHost>>,
}

impl CheckWork {
    pub fn new(
        stage: Stage,
        command: Option<String>,
        status_context: impl Into<String>,
        runner: ShellRunner,
        host: Option<Arc<dyn CodeHost>>,
    ) -> Self {
        Self {
            stage,
            command: command.filter(|c| !c.trim().is_empty()),
            status_context: status_context.into(),
            runner,
            host,
        }
    }

    async fn set_status(
        &self,
        ctx: &PhaseContext<'_>,
        sha: Option<&str>,
        state: CommitState,
        description: &str,
    ) {
        if let (Some(host), Some(sha)) = (&self.host, sha) {
            best_effort(
                "set commit status",
                host.set_commit_status(ctx.repo, sha, state, &self.status_context, description),
            )
            .await;
        }
    }
}

#[async_trait]
impl PhaseWork for CheckWork {
    async fn perform(&self, ctx: &PhaseContext<'_>) -> Result<PhaseReport, PhaseError> {
        let stage = self.stage;
        let Some(command) = &self.command else {
            info!(run_id = %ctx.run.id, %stage, "no command configured, skipping checks");
            return Ok(PhaseReport::passed(format!(
                "No {} command configured; checks skipped",
                stage
            )));
        };

        let sha = match &self.host {
            Some(host) => {
                best_effort("read head commit", host.head_sha(ctx.repo, ctx.branch)).await
            }
            None => {
                debug!(%stage, "no code host credentials, commit status disabled");
                None
            }
        };
        let description = format!("baton {} running", stage);
        self.set_status(ctx, sha.as_deref(), CommitState::Pending, &description)
            .await;

        let env = [
            ("BATON_RUN_ID", ctx.run.id.to_string()),
            ("BATON_REPO", ctx.repo.to_string()),
            ("BATON_BRANCH", ctx.branch.to_string()),
            (
                "BATON_PR_NUMBER",
                ctx.pr_number.map(|n| n.to_string()).unwrap_or_default(),
            ),
            ("BATON_STAGE", stage.to_string()),
        ];
        let result = self
            .runner
            .run_with_env(command, ctx.workspace, &env)
            .await;

        let (state, verdict, output) = match &result {
            Ok(outcome) if outcome.success => {
                (CommitState::Success, "passed", outcome.output.as_str())
            }
            Ok(outcome) => (CommitState::Failure, "failed", outcome.output.as_str()),
            Err(e) => (
                CommitState::Error,
                "errored",
                e.captured_output().unwrap_or_default(),
            ),
        };
        let description = format!("baton {} {}", stage, verdict);
        self.set_status(ctx, sha.as_deref(), state, &description)
            .await;

        if let (Some(host), Some(pr)) = (&self.host, ctx.pr_number) {
            let body = format!(
                "**baton {}** {} (attempt {})\n\n```\n{}\n```",
                stage,
                verdict,
                ctx.attempt,
                truncate_output(output, COMMENT_OUTPUT_LIMIT)
            );
            best_effort("comment on pull request", host.comment(ctx.repo, pr, &body)).await;
        }

        let outcome = result?;
        info!(
            run_id = %ctx.run.id,
            %stage,
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            "checks finished"
        );
        Ok(PhaseReport {
            success: outcome.success,
            output: outcome.output,
            branch: None,
            pr_number: None,
        })
    }
}
