//! Pure node transforms: each maps the current state to a patch.

use baton_common::{NodeName, Phase, Role, RunStatus, Task, TaskStatus, set_role_status};

use super::state::{StatePatch, WorkflowState};
use crate::hitl::HitlDecision;

/// Tasks created when planning completes for the first time in an iteration.
pub fn default_tasks() -> Vec<Task> {
    vec![
        Task::new("Draft implementation plan", Role::Plan, TaskStatus::Done),
        Task::new("Implement the change", Role::Dev, TaskStatus::Pending),
        Task::new("Review the change", Role::Review, TaskStatus::Pending),
        Task::new("Run operational checks", Role::Ops, TaskStatus::Pending),
    ]
}

/// Transform for a sequence node. Off-sequence nodes have their own
/// constructors ([`escalate`]) or none at all (`replan`).
pub fn transform(node: NodeName, state: &WorkflowState) -> StatePatch {
    match node {
        NodeName::Intake => StatePatch::default()
            .status(RunStatus::Running)
            .phase(Phase::Intake)
            .log(format!("[intake] accepted run {} for {}", state.run_id, state.repo)),
        NodeName::Plan => plan(state),
        NodeName::DevExecute => start_role(state, Role::Dev, Phase::Dev, "dev-execute"),
        NodeName::Review => start_role(state, Role::Review, Phase::Review, "review"),
        NodeName::Ops => start_role(state, Role::Ops, Phase::Ops, "ops"),
        NodeName::Report => report(state),
        NodeName::Escalate | NodeName::Replan => StatePatch::default(),
    }
}

fn plan(state: &WorkflowState) -> StatePatch {
    let summary = state
        .plan_summary
        .clone()
        .unwrap_or_else(|| format!("Draft plan for: {}", state.description));
    let mut patch = StatePatch::default()
        .phase(Phase::Plan)
        .plan_summary(summary.clone())
        .meta("planned_iteration", state.iteration)
        .log(format!("[plan] {}", summary));
    if state.tasks.is_empty() {
        patch = patch.tasks(default_tasks());
    }
    patch
}

fn start_role(state: &WorkflowState, role: Role, phase: Phase, label: &str) -> StatePatch {
    let mut tasks = state.tasks.clone();
    set_role_status(&mut tasks, role, TaskStatus::InProgress);
    StatePatch::default()
        .phase(phase)
        .tasks(tasks)
        .log(format!("[{}] attempt {}", label, state.retries.get(role)))
}

/// Terminal success: every downstream task done, run completed.
pub fn report(state: &WorkflowState) -> StatePatch {
    let mut tasks = state.tasks.clone();
    for role in [Role::Dev, Role::Review, Role::Ops] {
        set_role_status(&mut tasks, role, TaskStatus::Done);
    }
    let done = tasks.iter().filter(|t| t.status == TaskStatus::Done).count();
    let summary = format!("{} of {} tasks done", done, tasks.len());
    StatePatch::default()
        .phase(Phase::Report)
        .status(RunStatus::Completed)
        .tasks(tasks)
        .meta("result_summary", summary.clone())
        .log(format!("[report] {}", summary))
}

/// Pause the run for a human. Leaves the phase where it was.
pub fn escalate(decision: &HitlDecision) -> StatePatch {
    let reason = decision
        .reason
        .map(|r| r.as_str())
        .unwrap_or("unspecified");
    let requested = decision.requested_input.as_deref().unwrap_or("");
    StatePatch::default()
        .status(RunStatus::AwaitingUnblock)
        .meta("hitl_reason", reason)
        .log(format!("[escalate] {}: {}", reason, requested))
}
