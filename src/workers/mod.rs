//! Phase workers for the queue-driven stages (dev, review, ops).
//!
//! A [`PhaseWorker`] owns the run bookkeeping around one delivery: state
//! guards, the repository allow-list, the transactional start / success /
//! failure updates and the escalation decision. The stage's actual work is
//! behind [`PhaseWork`].

pub mod checks;
pub mod dev;

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use baton_common::{
    Delivery, Job, JobPayload, NewEvent, NewJob, NodeName, QueueName, Run, RunStatus, Stage,
    StageStatus, StepRecord, TaskStatus, Transition, set_role_status,
};
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::commands::{DEFAULT_OUTPUT_LIMIT, truncate_output};
use crate::config::RepoAllowlist;
use crate::errors::{PhaseError, WorkerError, panic_message};
use crate::hitl::{HitlPolicy, HitlSignals};
use crate::queue::JobHandler;
use crate::store::{Batch, DbHandle};
use crate::workflow::{WorkflowState, node};
use crate::workspace::Workspace;

pub use checks::CheckWork;
pub use dev::DevWork;

/// What a stage's work sees of the delivery.
#[derive(Debug)]
pub struct PhaseContext<'a> {
    pub run: &'a Run,
    pub attempt: u32,
    pub repo: &'a str,
    pub branch: &'a str,
    pub pr_number: Option<i64>,
    pub workspace: &'a Path,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub success: bool,
    pub output: String,
    /// Branch the work left its changes on, if it moved the run to one.
    pub branch: Option<String>,
    pub pr_number: Option<i64>,
}

impl PhaseReport {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            ..Default::default()
        }
    }
}

/// External side effects of one stage.
#[async_trait]
pub trait PhaseWork: Send + Sync {
    async fn perform(&self, ctx: &PhaseContext<'_>) -> Result<PhaseReport, PhaseError>;
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub allowlist: RepoAllowlist,
    pub hitl: HitlPolicy,
    pub workspace_root: PathBuf,
    pub output_limit: usize,
}

impl WorkerSettings {
    pub fn new(allowlist: RepoAllowlist, workspace_root: PathBuf) -> Self {
        Self {
            allowlist,
            hitl: HitlPolicy::default(),
            workspace_root,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

/// Why a delivery must not touch the run.
fn skip_reason(stage: Stage, run: &Run) -> Option<&'static str> {
    if run.status.is_terminal() {
        Some("run is terminal")
    } else if run.phase != stage.phase() {
        Some("run is not in this stage")
    } else if run.status == RunStatus::AwaitingUnblock && run.escalated {
        Some("run is escalated and awaits unblock")
    } else {
        None
    }
}

/// Whether `delivery` still holds the running stage. Outcomes of any other
/// delivery are dropped.
fn holds_stage(stage: Stage, run: &Run, delivery: Delivery) -> bool {
    !run.status.is_terminal()
        && run.phase == stage.phase()
        && run.stages.get(stage) == StageStatus::Running
        && run.active_delivery == Some(delivery)
}

/// Delivery details resolved against the run.
#[derive(Debug, Clone)]
struct Target {
    repo: String,
    branch: String,
    pr_number: Option<i64>,
}

impl Target {
    fn resolve(payload: &JobPayload, run: &Run) -> Self {
        Self {
            repo: payload
                .target_repo
                .clone()
                .unwrap_or_else(|| run.repo.clone()),
            branch: payload.branch.clone().unwrap_or_else(|| run.branch.clone()),
            pr_number: payload.pr_number.or(run.pr_number),
        }
    }
}

pub struct PhaseWorker {
    stage: Stage,
    db: DbHandle,
    work: Arc<dyn PhaseWork>,
    settings: WorkerSettings,
}

impl PhaseWorker {
    pub fn new(
        stage: Stage,
        db: DbHandle,
        work: Arc<dyn PhaseWork>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            stage,
            db,
            work,
            settings,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub async fn process(&self, job: &Job) -> Result<(), WorkerError> {
        let stage = self.stage;
        let run_id = job.payload.run_id;

        let Some(run) = self.db.get_run(run_id).await? else {
            warn!(%run_id, %stage, job_id = job.id, "run not found, dropping job");
            return Ok(());
        };
        if let Some(reason) = skip_reason(stage, &run) {
            info!(%run_id, %stage, job_id = job.id, "skipping delivery: {}", reason);
            return Ok(());
        }

        let target = Target::resolve(&job.payload, &run);
        if !self.settings.allowlist.allows(&target.repo) {
            self.refuse(run_id, target.repo.clone()).await?;
            return Err(WorkerError::RepoNotAllowed {
                stage,
                repo: target.repo,
            });
        }

        let delivery = job.delivery();
        let Some(run) = self.begin(run_id, delivery, &target).await? else {
            info!(
                %run_id, %stage, job_id = job.id,
                "run changed or stage held by another delivery, skipping"
            );
            return Ok(());
        };
        info!(%run_id, %stage, attempt = job.attempt, repo = %target.repo, "stage started");

        let result = self.perform(&run, job.attempt, &target).await;
        match result {
            Ok(report) if report.success => {
                self.succeed(run_id, delivery, target, report).await?;
                Ok(())
            }
            Ok(report) => {
                let reason = format!("{} checks failed", stage);
                self.fail(run_id, delivery, reason, Some(report.output), false)
                    .await
            }
            Err(e) => {
                let output = e.captured_output().map(str::to_string);
                self.fail(run_id, delivery, e.to_string(), output, e.is_missing_secret())
                    .await
            }
        }
    }

    /// Run the stage work inside a scratch workspace that is always cleaned up.
    async fn perform(
        &self,
        run: &Run,
        attempt: u32,
        target: &Target,
    ) -> Result<PhaseReport, PhaseError> {
        let workspace =
            Workspace::create(&self.settings.workspace_root, run.id, self.stage, attempt)?;
        self.note(
            run.id,
            NewEvent::new("workspace:init")
                .node(self.stage.node().as_str())
                .payload(json!({ "path": workspace.path().display().to_string() })),
        )
        .await;

        let ctx = PhaseContext {
            run,
            attempt,
            repo: &target.repo,
            branch: &target.branch,
            pr_number: target.pr_number,
            workspace: workspace.path(),
        };
        let result = match AssertUnwindSafe(self.work.perform(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(run_id = %run.id, stage = %self.stage, "stage work panicked: {}", message);
                Err(PhaseError::Panicked(message))
            }
        };

        let cleanup = match workspace.cleanup() {
            Ok(()) => NewEvent::new("workspace:cleanup").status("ok"),
            Err(e) => {
                warn!(run_id = %run.id, stage = %self.stage, "Workspace cleanup failed: {:#}", e);
                NewEvent::new("workspace:cleanup")
                    .status("failed")
                    .reason(e.to_string())
            }
        };
        self.note(run.id, cleanup.node(self.stage.node().as_str()))
            .await;
        result
    }

    /// Append a standalone event. Losing one only costs audit detail.
    async fn note(&self, run_id: Uuid, event: NewEvent) {
        if let Err(e) = self
            .db
            .call(move |db| db.append_event(run_id, &event))
            .await
        {
            warn!(%run_id, "Failed to append event: {:#}", e);
        }
    }

    async fn refuse(&self, run_id: Uuid, repo: String) -> Result<()> {
        let stage = self.stage;
        self.db
            .transact(run_id, move |run, batch| {
                if skip_reason(stage, run).is_some() {
                    return Ok(());
                }
                let reason = format!("Repo not allowed ({})", stage);
                run.stages.set(stage, StageStatus::Blocked);
                run.blocked_reason = Some(reason.clone());
                run.escalated = true;
                run.last_error = Some(reason.clone());
                run.record(
                    stage.node(),
                    Transition::Blocked,
                    RunStatus::AwaitingUnblock,
                    Some(reason.clone()),
                );
                batch.event(
                    NewEvent::new(format!("{}:failed", stage))
                        .node(stage.node().as_str())
                        .status(RunStatus::AwaitingUnblock.as_str())
                        .reason(reason)
                        .payload(json!({ "repo": repo })),
                );
                Ok(())
            })
            .await?;
        warn!(%run_id, %stage, "repository not allow-listed, run paused");
        Ok(())
    }

    /// Mark the stage running under `delivery`. Returns the updated run, or
    /// `None` when the guard no longer holds inside the transaction or another
    /// job already holds the stage. A redelivery of the holding job (its lease
    /// expired) takes the stage over.
    async fn begin(
        &self,
        run_id: Uuid,
        delivery: Delivery,
        target: &Target,
    ) -> Result<Option<Run>> {
        let stage = self.stage;
        let attempt = delivery.attempt;
        let branch = target.branch.clone();
        let pr_number = target.pr_number;
        let started = self
            .db
            .transact(run_id, move |run, batch| {
                if skip_reason(stage, run).is_some() {
                    return Ok(None);
                }
                let held_elsewhere = run.stages.get(stage) == StageStatus::Running
                    && run.active_delivery.map(|d| d.job_id) != Some(delivery.job_id);
                if held_elsewhere {
                    return Ok(None);
                }
                run.active_delivery = Some(delivery);
                run.stages.set(stage, StageStatus::Running);
                set_role_status(&mut run.tasks, stage.role(), TaskStatus::InProgress);
                run.blocked_reason = None;

                let mut snapshot = run.snapshot_at(RunStatus::Running, stage.phase(), stage.node());
                snapshot.retries.set(stage.role(), attempt);
                run.record_step(StepRecord::capture(
                    stage.node(),
                    Transition::Start,
                    snapshot,
                    None,
                ));
                batch.event(
                    NewEvent::new(format!("{}:start", stage))
                        .node(stage.node().as_str())
                        .status(RunStatus::Running.as_str())
                        .payload(json!({
                            "branch": branch,
                            "pr_number": pr_number,
                            "attempt": attempt,
                        })),
                );
                Ok(Some(run.clone()))
            })
            .await?;
        Ok(started.flatten())
    }

    async fn succeed(
        &self,
        run_id: Uuid,
        delivery: Delivery,
        target: Target,
        report: PhaseReport,
    ) -> Result<()> {
        let stage = self.stage;
        let limit = self.settings.output_limit;
        let applied = self
            .db
            .transact(run_id, move |run, batch| {
                if !holds_stage(stage, run, delivery) {
                    return Ok(false);
                }
                batch.event(output_event(stage, true, &report.output, limit));
                run.active_delivery = None;

                if let Some(branch) = report.branch {
                    run.branch = branch;
                }
                if report.pr_number.is_some() {
                    run.pr_number = report.pr_number;
                }
                run.stages.set(stage, StageStatus::Done);
                set_role_status(&mut run.tasks, stage.role(), TaskStatus::Done);
                run.last_error = None;
                run.record(stage.node(), Transition::Complete, RunStatus::Running, None);
                batch.event(
                    NewEvent::new(format!("{}:completed", stage))
                        .node(stage.node().as_str())
                        .status(StageStatus::Done.as_str())
                        .payload(json!({ "branch": run.branch, "pr_number": run.pr_number })),
                );

                match stage.next() {
                    Some(next) => hand_off(run, batch, next, &target.repo),
                    None => complete_run(run, batch),
                }
                Ok(true)
            })
            .await?;
        if applied == Some(true) {
            info!(%run_id, %stage, "stage completed");
        } else {
            info!(
                %run_id, %stage, job_id = delivery.job_id,
                "stage no longer held, success dropped"
            );
        }
        Ok(())
    }

    async fn fail(
        &self,
        run_id: Uuid,
        delivery: Delivery,
        error: String,
        output: Option<String>,
        missing_secret: bool,
    ) -> Result<(), WorkerError> {
        let stage = self.stage;
        let attempt = delivery.attempt;
        let policy = self.settings.hitl;
        let limit = self.settings.output_limit;
        let reason = error.clone();
        let escalated = self
            .db
            .transact(run_id, move |run, batch| {
                if !holds_stage(stage, run, delivery) {
                    return Ok(None);
                }
                if let Some(output) = &output {
                    batch.event(output_event(stage, false, output, limit));
                }
                run.active_delivery = None;
                let signals = HitlSignals {
                    missing_secret: missing_secret || run.signals.missing_secret,
                    ..HitlSignals::from(run.signals)
                }
                .with_failed_attempts(attempt);
                let decision = policy.evaluate(&signals);

                run.stages.set(stage, StageStatus::Blocked);
                set_role_status(&mut run.tasks, stage.role(), TaskStatus::Blocked);
                run.last_error = Some(error.clone());
                let blocked_reason = match decision.reason.filter(|_| decision.escalate) {
                    Some(hitl) => format!("HITL: {}", hitl),
                    None => error.clone(),
                };
                run.blocked_reason = Some(blocked_reason.clone());
                run.escalated = decision.escalate;
                run.record(
                    stage.node(),
                    Transition::Blocked,
                    RunStatus::AwaitingUnblock,
                    Some(blocked_reason),
                );

                batch.event(
                    NewEvent::new(format!("{}:failed", stage))
                        .node(stage.node().as_str())
                        .status(RunStatus::AwaitingUnblock.as_str())
                        .reason(error.clone())
                        .payload(json!({ "attempt": attempt })),
                );
                let followup = if decision.escalate {
                    NewEvent::new("hitl:escalated").payload(json!({
                        "reason": decision.reason.map(|r| r.as_str()),
                        "requested_input": decision.requested_input,
                    }))
                } else {
                    NewEvent::new("hitl:pending").payload(json!({ "attempt": attempt }))
                };
                batch.event(
                    followup
                        .node(stage.node().as_str())
                        .status(RunStatus::AwaitingUnblock.as_str())
                        .reason(error),
                );
                Ok(Some(decision.escalate))
            })
            .await?;

        match escalated.flatten() {
            Some(true) => {
                warn!(%run_id, %stage, attempt, "stage failed, escalated to human: {}", reason)
            }
            Some(false) => warn!(%run_id, %stage, attempt, "stage failed: {}", reason),
            None => {
                info!(
                    %run_id, %stage, job_id = delivery.job_id,
                    "stage no longer held, failure dropped: {}", reason
                );
                return Ok(());
            }
        }
        Err(WorkerError::PhaseFailed { stage, reason })
    }
}

fn output_event(stage: Stage, success: bool, output: &str, limit: usize) -> NewEvent {
    NewEvent::new(format!("{}:output", stage))
        .node(stage.node().as_str())
        .payload(json!({
            "success": success,
            "output": truncate_output(output, limit),
        }))
}

/// Queue the next stage: a `start` step with status `queued` moves the run
/// into that stage's phase, and its job is enqueued in the same batch.
fn hand_off(run: &mut Run, batch: &mut Batch, next: Stage, repo: &str) {
    run.stages.set(next, StageStatus::Queued);
    run.record(next.node(), Transition::Start, RunStatus::Queued, None);
    batch.enqueue(NewJob::new(
        QueueName::for_stage(next),
        JobPayload {
            run_id: run.id,
            target_repo: Some(repo.to_string()),
            branch: Some(run.branch.clone()),
            pr_number: run.pr_number,
        },
    ));
    debug!(run_id = %run.id, next = %next, "next stage enqueued");
}

/// Apply the report transform after the last stage.
fn complete_run(run: &mut Run, batch: &mut Batch) {
    run.record(NodeName::Report, Transition::Start, RunStatus::Running, None);
    let mut state = WorkflowState::from_run(run);
    let patch = node::report(&state);
    state.apply(patch);
    state.project_onto(run);
    run.record(NodeName::Report, Transition::Complete, state.status, None);
    batch.event(
        NewEvent::new("run:completed")
            .node(NodeName::Report.as_str())
            .status(run.status.as_str())
            .payload(json!({
                "branch": run.branch,
                "pr_number": run.pr_number,
                "summary": state.metadata.get("result_summary"),
            })),
    );
}

#[async_trait]
impl JobHandler for PhaseWorker {
    fn queue(&self) -> QueueName {
        QueueName::for_stage(self.stage)
    }

    async fn handle(&self, job: &Job) -> Result<(), WorkerError> {
        self.process(job).await
    }
}
