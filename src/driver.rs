//! Orchestration driver: runs the graph executor for one run and persists
//! every step as it is emitted.
//!
//! In pipeline mode the driver owns the nodes before the handoff node
//! (`intake`, `plan`). Reaching the handoff node queues the first phase
//! worker instead of running it in-process.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use baton_common::{
    Job, JobPayload, NewEvent, NewJob, NodeName, QueueName, Run, RunStatus, Stage, StageStatus,
    StepRecord, Transition,
};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::WorkerError;
use crate::hitl::HitlPolicy;
use crate::queue::JobHandler;
use crate::store::DbHandle;
use crate::workflow::{
    ExecutionResult, ExecutorInput, Outcome, StepObserver, WorkflowExecutor, WorkflowState,
    resolve_next_node,
};

/// Persists each step with its projection and event in one transaction.
struct PersistStep {
    db: DbHandle,
    run_id: Uuid,
}

#[async_trait]
impl StepObserver for PersistStep {
    async fn on_step(
        &mut self,
        step: &StepRecord,
        state: &WorkflowState,
        _steps: &[StepRecord],
    ) -> Result<()> {
        let step = step.clone();
        let state = state.clone();
        let persisted = self
            .db
            .transact(self.run_id, move |run, batch| {
                let mut event = NewEvent::new(format!(
                    "orchestrator:{}:{}",
                    step.node, step.transition
                ))
                .node(step.node.as_str())
                .status(step.status.as_str());
                if let Some(reason) = &step.reason {
                    event = event.reason(reason.clone());
                }
                match step.transition {
                    Transition::Fail => run.last_error = step.reason.clone(),
                    Transition::Blocked => {
                        run.blocked_reason = step.reason.clone();
                        run.escalated = step.node == NodeName::Escalate;
                    }
                    Transition::Start | Transition::Complete => {}
                }
                run.record_step(step);
                state.project_onto(run);
                batch.event(event.payload(json!({
                    "iteration": run.iteration,
                    "retries": run.retries,
                })));
                Ok(())
            })
            .await?;
        persisted.ok_or_else(|| anyhow!("Run {} disappeared while executing", self.run_id))
    }
}

/// Why the driver left a run alone.
fn skip_reason(
    run: &Run,
    next: Option<NodeName>,
    handoff: Option<NodeName>,
) -> Option<&'static str> {
    if run.status.is_terminal() {
        return Some("run is terminal");
    }
    if run.status == RunStatus::AwaitingUnblock {
        return Some("run awaits unblock");
    }
    let Some(next) = next else {
        return Some("history has no next node");
    };
    if let Some(handoff) = handoff {
        if next.position() > handoff.position() {
            return Some("run is owned by the phase workers");
        }
        let handed_off = run
            .last_step()
            .is_some_and(|s| s.node == handoff && s.transition == Transition::Start);
        if handed_off {
            return Some("run was already handed off");
        }
    }
    None
}

pub struct OrchestrationDriver {
    db: DbHandle,
    executor: WorkflowExecutor,
    handoff: Option<NodeName>,
}

impl OrchestrationDriver {
    pub fn new(db: DbHandle, policy: HitlPolicy, handoff: Option<NodeName>) -> Self {
        Self {
            db,
            executor: WorkflowExecutor::new(policy),
            handoff,
        }
    }

    /// Advance a run from its persisted history. Returns `None` when the
    /// run was left untouched.
    pub async fn drive(&self, run_id: Uuid) -> Result<Option<ExecutionResult>> {
        let Some(run) = self.db.get_run(run_id).await? else {
            warn!(%run_id, "run not found");
            return Ok(None);
        };
        let next = resolve_next_node(&run.history);
        if let Some(reason) = skip_reason(&run, next, self.handoff) {
            debug!(%run_id, "not driving run: {}", reason);
            return Ok(None);
        }

        info!(%run_id, start = ?next, iteration = run.iteration, "driving run");
        let input = ExecutorInput::for_run(&run).with_handoff(self.handoff);
        let mut observer = PersistStep {
            db: self.db.clone(),
            run_id,
        };
        let result = self.executor.execute(input, &mut observer).await?;

        match &result.outcome {
            Outcome::HandedOff(node) => self.hand_off(run_id, *node, &result).await?,
            outcome => self.summarize(run_id, outcome, &result).await?,
        }
        info!(%run_id, outcome = result.outcome.label(), steps = result.new_steps, "run driven");
        Ok(Some(result))
    }

    /// Queue the phase worker that owns `node`, recording the handoff as a
    /// queued `start` step.
    async fn hand_off(
        &self,
        run_id: Uuid,
        node: NodeName,
        result: &ExecutionResult,
    ) -> Result<()> {
        let stage = node
            .phase()
            .and_then(Stage::from_phase)
            .ok_or_else(|| anyhow!("Node {} has no phase worker", node))?;
        let steps = result.new_steps;
        self.db
            .transact(run_id, move |run, batch| {
                run.stages.set(stage, StageStatus::Queued);
                run.record(node, Transition::Start, RunStatus::Queued, None);
                let payload = JobPayload {
                    run_id,
                    target_repo: Some(run.repo.clone()),
                    branch: Some(run.branch.clone()),
                    pr_number: run.pr_number,
                };
                batch.event(
                    NewEvent::new("orchestrator:handoff")
                        .node(node.as_str())
                        .status(RunStatus::Queued.as_str())
                        .payload(json!({ "queue": QueueName::for_stage(stage).as_str() })),
                );
                batch.event(summary_event("handed_off", steps, None));
                batch.enqueue(NewJob::new(QueueName::for_stage(stage), payload));
                Ok(())
            })
            .await?
            .ok_or_else(|| anyhow!("Run {} disappeared before handoff", run_id))?;
        info!(%run_id, %stage, "handed off to phase worker");
        Ok(())
    }

    async fn summarize(
        &self,
        run_id: Uuid,
        outcome: &Outcome,
        result: &ExecutionResult,
    ) -> Result<()> {
        let label = outcome.label();
        let steps = result.new_steps;
        let escalation = match outcome {
            Outcome::Escalated(reason) => Some(*reason),
            _ => None,
        };
        let reason = match outcome {
            Outcome::Failed { reason } => Some(reason.clone()),
            Outcome::Escalated(reason) => Some(format!("hitl:{}", reason)),
            _ => None,
        };
        self.db
            .transact(run_id, move |_run, batch| {
                if let Some(hitl) = escalation {
                    batch.event(
                        NewEvent::new("hitl:escalated")
                            .node(NodeName::Escalate.as_str())
                            .status(RunStatus::AwaitingUnblock.as_str())
                            .payload(json!({
                                "reason": hitl.as_str(),
                                "requested_input": hitl.requested_input(),
                            })),
                    );
                }
                batch.event(summary_event(label, steps, reason));
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn summary_event(outcome: &str, steps: usize, reason: Option<String>) -> NewEvent {
    let event = NewEvent::new("orchestrator:summary")
        .status(outcome)
        .payload(json!({ "outcome": outcome, "steps": steps }));
    match reason {
        Some(reason) => event.reason(reason),
        None => event,
    }
}

#[async_trait]
impl JobHandler for OrchestrationDriver {
    fn queue(&self) -> QueueName {
        QueueName::Runs
    }

    async fn handle(&self, job: &Job) -> Result<(), WorkerError> {
        self.drive(job.payload.run_id).await?;
        Ok(())
    }
}
