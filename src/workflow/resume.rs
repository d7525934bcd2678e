//! Recover the execution position of a run from its step history.

use baton_common::{NodeName, StepRecord, Transition};

/// Decide which node a run should resume at.
///
/// - empty history: start at `intake`
/// - last record is `blocked` or `fail`: nothing, a human or a replan must act
/// - otherwise the node after the most recent `complete`, or nothing after
///   `report`
///
/// A history with no `complete` record at all restarts at `intake`, and a
/// completed `replan` resumes at `plan`.
pub fn resolve_next_node(history: &[StepRecord]) -> Option<NodeName> {
    let Some(last) = history.last() else {
        return Some(NodeName::Intake);
    };
    if matches!(last.transition, Transition::Blocked | Transition::Fail) {
        return None;
    }

    let Some(completed) = history
        .iter()
        .rev()
        .find(|step| step.transition == Transition::Complete)
    else {
        return Some(NodeName::Intake);
    };

    match completed.node {
        NodeName::Replan => Some(NodeName::Plan),
        NodeName::Escalate => Some(NodeName::Intake),
        node => node.next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_common::{NewRun, Run, RunStatus};
    use uuid::Uuid;

    fn step(node: NodeName, transition: Transition) -> StepRecord {
        let run = Run::new(
            Uuid::new_v4(),
            NewRun {
                repo: "acme/widgets".into(),
                description: "x".into(),
                ..Default::default()
            },
            2,
        );
        let phase = node.phase().unwrap_or(run.phase);
        StepRecord::capture(
            node,
            transition,
            run.snapshot_at(RunStatus::Running, phase, node),
            None,
        )
    }

    #[test]
    fn test_empty_history_starts_at_intake() {
        assert_eq!(resolve_next_node(&[]), Some(NodeName::Intake));
    }

    #[test]
    fn test_blocked_tail_halts() {
        let history = vec![
            step(NodeName::Intake, Transition::Complete),
            step(NodeName::Plan, Transition::Start),
            step(NodeName::Plan, Transition::Blocked),
        ];
        assert_eq!(resolve_next_node(&history), None);
    }

    #[test]
    fn test_fail_tail_halts() {
        let history = vec![
            step(NodeName::Review, Transition::Start),
            step(NodeName::Review, Transition::Fail),
        ];
        assert_eq!(resolve_next_node(&history), None);
    }

    #[test]
    fn test_resumes_after_last_complete() {
        let history = vec![
            step(NodeName::Intake, Transition::Start),
            step(NodeName::Intake, Transition::Complete),
            step(NodeName::Plan, Transition::Start),
            step(NodeName::Plan, Transition::Complete),
            step(NodeName::DevExecute, Transition::Start),
        ];
        assert_eq!(resolve_next_node(&history), Some(NodeName::DevExecute));
    }

    #[test]
    fn test_truncated_after_review_resumes_at_ops() {
        let history = vec![
            step(NodeName::Review, Transition::Start),
            step(NodeName::Review, Transition::Complete),
        ];
        assert_eq!(resolve_next_node(&history), Some(NodeName::Ops));
    }

    #[test]
    fn test_report_complete_has_no_successor() {
        let history = vec![step(NodeName::Report, Transition::Complete)];
        assert_eq!(resolve_next_node(&history), None);
    }

    #[test]
    fn test_no_complete_record_restarts() {
        let history = vec![step(NodeName::Intake, Transition::Start)];
        assert_eq!(resolve_next_node(&history), Some(NodeName::Intake));
    }

    #[test]
    fn test_replan_resumes_at_plan() {
        let history = vec![
            step(NodeName::DevExecute, Transition::Fail),
            step(NodeName::Replan, Transition::Complete),
        ];
        assert_eq!(resolve_next_node(&history), Some(NodeName::Plan));
    }
}
