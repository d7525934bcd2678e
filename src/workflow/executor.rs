//! Graph executor for the fixed phase sequence.
//!
//! One invocation walks `intake → plan → dev-execute → review → ops → report`
//! from a start node, enforcing per-role retry ceilings and replanning when
//! a ceiling is hit while iteration budget remains. Every transition is
//! emitted as a [`StepRecord`] and handed to a [`StepObserver`] before the
//! executor moves on.

use async_trait::async_trait;
use baton_common::{NodeName, Retries, Run, RunStatus, StepRecord, Transition};
use tracing::{debug, info, warn};

use super::node;
use super::resume::resolve_next_node;
use super::state::WorkflowState;
use crate::errors::WorkflowError;
use crate::hitl::{HitlPolicy, HitlReason, HitlSignals};

pub const DEFAULT_MAX_ITERATIONS: u32 = 2;

/// Receives every step as soon as it is emitted. An error aborts execution.
#[async_trait]
pub trait StepObserver: Send {
    async fn on_step(
        &mut self,
        step: &StepRecord,
        state: &WorkflowState,
        steps: &[StepRecord],
    ) -> anyhow::Result<()>;
}

/// Observer that discards steps.
pub struct NoopObserver;

#[async_trait]
impl StepObserver for NoopObserver {
    async fn on_step(
        &mut self,
        _step: &StepRecord,
        _state: &WorkflowState,
        _steps: &[StepRecord],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything one invocation needs.
#[derive(Debug, Clone)]
pub struct ExecutorInput {
    /// Initial state: identity, descriptive fields, retries, tasks, iteration.
    pub state: WorkflowState,
    /// Previously recorded steps. New steps are appended after them.
    pub history: Vec<StepRecord>,
    /// Node to start at. Resolved from `history` when absent.
    pub start_node: Option<NodeName>,
    /// Stop before running this node and report a handoff.
    pub handoff: Option<NodeName>,
}

impl ExecutorInput {
    pub fn for_run(run: &Run) -> Self {
        Self {
            state: WorkflowState::from_run(run),
            history: run.history.clone(),
            start_node: None,
            handoff: None,
        }
    }

    pub fn start_at(mut self, node: NodeName) -> Self {
        self.start_node = Some(node);
        self
    }

    pub fn with_handoff(mut self, node: Option<NodeName>) -> Self {
        self.handoff = node;
        self
    }

    pub fn with_retries(mut self, retries: Retries) -> Self {
        self.state.retries = retries;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.state.max_iterations = max_iterations;
        self
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `report` completed.
    Completed,
    /// A retry ceiling was hit with no iteration budget left.
    Failed { reason: String },
    /// A transform paused the run.
    Blocked,
    /// The escalation policy paused the run.
    Escalated(HitlReason),
    /// Execution reached the handoff node without running it.
    HandedOff(NodeName),
    /// The history had no next node, nothing ran.
    Halted,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Blocked => "blocked",
            Self::Escalated(_) => "escalated",
            Self::HandedOff(_) => "handed_off",
            Self::Halted => "halted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub state: WorkflowState,
    /// Prior history followed by the steps emitted in this invocation.
    pub steps: Vec<StepRecord>,
    /// Number of steps emitted in this invocation.
    pub new_steps: usize,
    pub outcome: Outcome,
}

impl ExecutionResult {
    /// Nodes that emitted a `start` step in this invocation, in order.
    pub fn visited(&self) -> Vec<NodeName> {
        self.steps[self.steps.len() - self.new_steps..]
            .iter()
            .filter(|s| s.transition == Transition::Start)
            .map(|s| s.node)
            .collect()
    }
}

struct Recorder<'a> {
    steps: Vec<StepRecord>,
    new_steps: usize,
    observer: &'a mut dyn StepObserver,
}

impl Recorder<'_> {
    async fn emit(
        &mut self,
        node: NodeName,
        transition: Transition,
        state: &WorkflowState,
        reason: Option<String>,
    ) -> Result<(), WorkflowError> {
        debug!(run_id = %state.run_id, node = %node, transition = %transition, "step");
        self.steps
            .push(StepRecord::capture(node, transition, state.snapshot(), reason));
        self.new_steps += 1;
        let Self {
            steps, observer, ..
        } = self;
        if let Some(step) = steps.last() {
            observer
                .on_step(step, state, steps)
                .await
                .map_err(|source| WorkflowError::StepPersistence {
                    node,
                    transition: transition.as_str(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowExecutor {
    policy: HitlPolicy,
}

impl WorkflowExecutor {
    pub fn new(policy: HitlPolicy) -> Self {
        Self { policy }
    }

    pub async fn execute(
        &self,
        input: ExecutorInput,
        observer: &mut dyn StepObserver,
    ) -> Result<ExecutionResult, WorkflowError> {
        let ExecutorInput {
            mut state,
            history,
            start_node,
            handoff,
        } = input;
        let start = start_node.or_else(|| resolve_next_node(&history));
        let mut rec = Recorder {
            steps: history,
            new_steps: 0,
            observer,
        };

        let Some(mut node) = start else {
            return Ok(ExecutionResult {
                state,
                steps: rec.steps,
                new_steps: 0,
                outcome: Outcome::Halted,
            });
        };

        let outcome = loop {
            if handoff == Some(node) {
                break Outcome::HandedOff(node);
            }

            state.current_node = node;
            if let Some(phase) = node.phase() {
                state.phase = phase;
            }
            state.status = RunStatus::Running;
            rec.emit(node, Transition::Start, &state, None).await?;

            if let Some(role) = node.role() {
                let decision = self.policy.evaluate(&HitlSignals::from(state.signals));
                if let (true, Some(reason)) = (decision.escalate, decision.reason) {
                    info!(run_id = %state.run_id, node = %node, reason = %reason, "escalating to human");
                    state.current_node = NodeName::Escalate;
                    rec.emit(NodeName::Escalate, Transition::Start, &state, None)
                        .await?;
                    state.apply(node::escalate(&decision));
                    rec.emit(
                        NodeName::Escalate,
                        Transition::Blocked,
                        &state,
                        Some(format!("hitl:{}", reason)),
                    )
                    .await?;
                    break Outcome::Escalated(reason);
                }

                let attempt = state.retries.get(role) + 1;
                if attempt > role.retry_ceiling() {
                    let reason = format!("retry limit exceeded for {}", node);
                    if state.iteration < state.max_iterations {
                        warn!(run_id = %state.run_id, node = %node, iteration = state.iteration, "{}, replanning", reason);
                        rec.emit(node, Transition::Fail, &state, Some(reason.clone()))
                            .await?;
                        state.retries = Retries::default();
                        state.tasks.clear();
                        state.iteration += 1;
                        state.current_node = NodeName::Replan;
                        state
                            .logs
                            .push(format!("[replan] iteration {}: {}", state.iteration, reason));
                        rec.emit(NodeName::Replan, Transition::Complete, &state, Some(reason))
                            .await?;
                        node = NodeName::Plan;
                        continue;
                    }
                    warn!(run_id = %state.run_id, node = %node, "{}, no iterations left", reason);
                    state.status = RunStatus::Failed;
                    rec.emit(node, Transition::Fail, &state, Some(reason.clone()))
                        .await?;
                    break Outcome::Failed { reason };
                }
                state.retries.set(role, attempt);
            }

            let patch = node::transform(node, &state);
            state.apply(patch);

            if state.status == RunStatus::AwaitingUnblock {
                rec.emit(node, Transition::Blocked, &state, None).await?;
                break Outcome::Blocked;
            }
            rec.emit(node, Transition::Complete, &state, None).await?;

            match node.next() {
                Some(next) => node = next,
                None => break Outcome::Completed,
            }
        };

        Ok(ExecutionResult {
            state,
            steps: rec.steps,
            new_steps: rec.new_steps,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_common::{NewRun, Phase, RiskSignals, Role, TaskStatus};
    use uuid::Uuid;

    fn run() -> Run {
        Run::new(
            Uuid::new_v4(),
            NewRun {
                repo: "acme/widgets".into(),
                description: "Add audit logging".into(),
                ..Default::default()
            },
            DEFAULT_MAX_ITERATIONS,
        )
    }

    async fn execute(input: ExecutorInput) -> ExecutionResult {
        WorkflowExecutor::default()
            .execute(input, &mut NoopObserver)
            .await
            .unwrap()
    }

    /// Observer that records what it saw and optionally fails on a node.
    #[derive(Default)]
    struct Collecting {
        seen: Vec<(NodeName, Transition)>,
        fail_on: Option<NodeName>,
    }

    #[async_trait]
    impl StepObserver for Collecting {
        async fn on_step(
            &mut self,
            step: &StepRecord,
            _state: &WorkflowState,
            steps: &[StepRecord],
        ) -> anyhow::Result<()> {
            assert_eq!(steps.last(), Some(step));
            if self.fail_on == Some(step.node) {
                anyhow::bail!("store unavailable");
            }
            self.seen.push((step.node, step.transition));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_happy_path_visits_every_node() {
        let result = execute(ExecutorInput::for_run(&run())).await;

        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(result.visited(), NodeName::SEQUENCE.to_vec());
        assert_eq!(result.state.status, RunStatus::Completed);
        assert_eq!(result.state.phase, Phase::Report);
        assert_eq!(
            result.state.retries,
            Retries {
                plan: 1,
                dev: 1,
                review: 1,
                ops: 1
            }
        );
        assert!(result.state.tasks.iter().all(|t| t.status == TaskStatus::Done));
        assert_eq!(result.new_steps, 12);
    }

    #[tokio::test]
    async fn test_every_step_reaches_observer_in_order() {
        let mut observer = Collecting::default();
        let result = WorkflowExecutor::default()
            .execute(ExecutorInput::for_run(&run()), &mut observer)
            .await
            .unwrap();
        assert_eq!(observer.seen.len(), result.new_steps);
        assert_eq!(observer.seen[0], (NodeName::Intake, Transition::Start));
        assert_eq!(observer.seen[11], (NodeName::Report, Transition::Complete));
    }

    #[tokio::test]
    async fn test_dev_ceiling_replans_and_completes() {
        let input = ExecutorInput::for_run(&run()).with_retries(Retries {
            dev: 2,
            ..Default::default()
        });
        let result = execute(input).await;

        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(result.state.iteration, 2);
        let replan = result
            .steps
            .iter()
            .find(|s| s.node == NodeName::Replan)
            .expect("replan step");
        assert_eq!(replan.retries, Retries::default());
        assert_eq!(
            replan.reason.as_deref(),
            Some("retry limit exceeded for dev-execute")
        );
        assert_eq!(result.state.retries.dev, 1);
    }

    #[tokio::test]
    async fn test_plan_ceiling_replans() {
        let input = ExecutorInput::for_run(&run()).with_retries(Retries {
            plan: 2,
            ..Default::default()
        });
        let result = execute(input).await;
        assert_eq!(result.outcome, Outcome::Completed);
        assert!(result.steps.iter().any(|s| s.node == NodeName::Replan));
    }

    #[tokio::test]
    async fn test_dev_ceiling_without_budget_fails() {
        let input = ExecutorInput::for_run(&run())
            .with_retries(Retries {
                dev: 2,
                ..Default::default()
            })
            .with_max_iterations(1);
        let result = execute(input).await;

        assert_eq!(
            result.outcome,
            Outcome::Failed {
                reason: "retry limit exceeded for dev-execute".into()
            }
        );
        assert_eq!(result.state.status, RunStatus::Failed);
        assert!(!result.visited().contains(&NodeName::Review));
        let last = result.steps.last().unwrap();
        assert_eq!(last.transition, Transition::Fail);
        assert_eq!(last.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_review_ceiling_fails_before_ops() {
        let input = ExecutorInput::for_run(&run())
            .with_retries(Retries {
                review: 1,
                ..Default::default()
            })
            .with_max_iterations(1);
        let result = execute(input).await;

        assert_eq!(result.state.status, RunStatus::Failed);
        assert_eq!(
            result.steps.last().and_then(|s| s.reason.as_deref()),
            Some("retry limit exceeded for review")
        );
        assert!(!result.visited().contains(&NodeName::Ops));
    }

    #[tokio::test]
    async fn test_ops_ceiling_never_reports() {
        let input = ExecutorInput::for_run(&run())
            .with_retries(Retries {
                ops: 1,
                ..Default::default()
            })
            .with_max_iterations(1);
        let result = execute(input).await;
        assert_eq!(result.state.status, RunStatus::Failed);
        assert!(!result.visited().contains(&NodeName::Report));
    }

    #[tokio::test]
    async fn test_resume_from_ops_completes() {
        let first = execute(ExecutorInput::for_run(&run())).await;
        let cut = first
            .steps
            .iter()
            .position(|s| s.node == NodeName::Review && s.transition == Transition::Complete)
            .unwrap();
        let mut input = ExecutorInput::for_run(&run()).start_at(NodeName::Ops);
        input.history = first.steps[..=cut].to_vec();
        input.state.retries = first.steps[cut].retries;
        input.state.tasks = first.steps[cut].snapshot.tasks.clone();

        let result = execute(input).await;
        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(result.visited(), vec![NodeName::Ops, NodeName::Report]);
        assert_eq!(result.steps.len(), cut + 1 + 4);
    }

    #[tokio::test]
    async fn test_resolves_start_node_from_history() {
        let first = execute(ExecutorInput::for_run(&run())).await;
        let cut = first
            .steps
            .iter()
            .position(|s| s.node == NodeName::Plan && s.transition == Transition::Complete)
            .unwrap();
        let mut input = ExecutorInput::for_run(&run());
        input.history = first.steps[..=cut].to_vec();
        let result = execute(input).await;
        assert_eq!(result.visited()[0], NodeName::DevExecute);
    }

    #[tokio::test]
    async fn test_blocked_history_halts_without_steps() {
        let mut base = run();
        let snapshot = base.snapshot_at(RunStatus::AwaitingUnblock, Phase::Plan, NodeName::Plan);
        base.record_step(StepRecord::capture(
            NodeName::Plan,
            Transition::Blocked,
            snapshot,
            None,
        ));
        let result = execute(ExecutorInput::for_run(&base)).await;
        assert_eq!(result.outcome, Outcome::Halted);
        assert_eq!(result.new_steps, 0);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].transition, Transition::Blocked);
    }

    #[tokio::test]
    async fn test_risk_signal_escalates_at_plan() {
        let mut flagged = run();
        flagged.signals = RiskSignals {
            destructive_change: true,
            ..Default::default()
        };
        let result = execute(ExecutorInput::for_run(&flagged)).await;

        assert_eq!(result.outcome, Outcome::Escalated(HitlReason::DestructiveChange));
        assert_eq!(result.state.status, RunStatus::AwaitingUnblock);
        let last = result.steps.last().unwrap();
        assert_eq!(last.node, NodeName::Escalate);
        assert_eq!(last.transition, Transition::Blocked);
        assert_eq!(last.reason.as_deref(), Some("hitl:destructive-change"));
        assert_eq!(last.phase, Phase::Plan);
        assert_eq!(result.state.retries.get(Role::Plan), 0);
    }

    #[tokio::test]
    async fn test_handoff_stops_before_node() {
        let input = ExecutorInput::for_run(&run()).with_handoff(Some(NodeName::DevExecute));
        let result = execute(input).await;
        assert_eq!(result.outcome, Outcome::HandedOff(NodeName::DevExecute));
        assert_eq!(result.visited(), vec![NodeName::Intake, NodeName::Plan]);
        assert_eq!(result.state.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_observer_error_aborts() {
        let mut observer = Collecting {
            fail_on: Some(NodeName::Plan),
            ..Default::default()
        };
        let err = WorkflowExecutor::default()
            .execute(ExecutorInput::for_run(&run()), &mut observer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::StepPersistence {
                node: NodeName::Plan,
                transition: "start",
                ..
            }
        ));
        assert_eq!(observer.seen.len(), 2);
    }

    #[tokio::test]
    async fn test_deterministic_outcomes() {
        let base = run();
        let a = execute(ExecutorInput::for_run(&base)).await;
        let b = execute(ExecutorInput::for_run(&base)).await;
        let strip = |r: &ExecutionResult| {
            r.steps
                .iter()
                .map(|s| (s.node, s.transition, s.status, s.retries))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&a), strip(&b));
        assert_eq!(a.state.tasks, b.state.tasks);
    }
}
