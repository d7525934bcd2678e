//! Human unblock: resume a paused run at the phase it stopped in.

use anyhow::Result;
use baton_common::{
    JobPayload, NewEvent, NewJob, NodeName, Phase, QueueName, RiskSignals, RunStatus, Stage,
    StageStatus, TaskStatus, Transition, set_role_status,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::store::DbHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnblockOutcome {
    NotFound,
    /// The run was not awaiting an unblock.
    Skipped { status: RunStatus },
    Resumed { node: NodeName, queue: QueueName },
}

/// Where a run paused in `phase` resumes. The entry queue re-runs the
/// driver; stage queues go straight to the phase worker.
pub fn resume_target(phase: Phase) -> (NodeName, QueueName, Option<Stage>) {
    match phase {
        Phase::Intake => (NodeName::Intake, QueueName::Runs, None),
        Phase::Plan => (NodeName::Plan, QueueName::Runs, None),
        Phase::Review => (NodeName::Review, QueueName::Review, Some(Stage::Review)),
        Phase::Ops => (NodeName::Ops, QueueName::Ops, Some(Stage::Ops)),
        Phase::Dev | Phase::Report => (NodeName::DevExecute, QueueName::Dev, Some(Stage::Dev)),
    }
}

pub async fn unblock(db: &DbHandle, run_id: Uuid) -> Result<UnblockOutcome> {
    let outcome = db
        .transact(run_id, move |run, batch| {
            if run.status != RunStatus::AwaitingUnblock {
                return Ok(UnblockOutcome::Skipped { status: run.status });
            }
            let (node, queue, stage) = resume_target(run.phase);
            let previous_reason = run.blocked_reason.take();
            let previous_phase = run.phase;
            run.escalated = false;
            run.signals = RiskSignals::default();
            run.active_delivery = None;

            if let Some(stage) = stage {
                run.stages.set(stage, StageStatus::Queued);
                let mut later = stage.next();
                while let Some(next) = later {
                    if run.stages.get(next) != StageStatus::Done {
                        run.stages.set(next, StageStatus::Pending);
                    }
                    later = next.next();
                }
                set_role_status(&mut run.tasks, stage.role(), TaskStatus::Pending);
            }
            run.record(node, Transition::Start, RunStatus::Queued, None);

            batch.event(
                NewEvent::new("hitl:unblocked")
                    .node(node.as_str())
                    .status(RunStatus::Queued.as_str())
                    .payload(json!({
                        "previous_reason": previous_reason,
                        "phase": previous_phase.as_str(),
                    })),
            );
            batch.event(
                NewEvent::new("hitl:resume_enqueued")
                    .node(node.as_str())
                    .payload(json!({
                        "queue": queue.as_str(),
                        "branch": run.branch,
                        "pr_number": run.pr_number,
                    })),
            );
            batch.enqueue(NewJob::new(
                queue,
                JobPayload {
                    run_id: run.id,
                    target_repo: Some(run.repo.clone()),
                    branch: Some(run.branch.clone()),
                    pr_number: run.pr_number,
                },
            ));
            Ok(UnblockOutcome::Resumed { node, queue })
        })
        .await?;

    let outcome = outcome.unwrap_or(UnblockOutcome::NotFound);
    if let UnblockOutcome::Resumed { node, queue } = &outcome {
        info!(%run_id, %node, %queue, "run unblocked");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use baton_common::{NewRun, Run};

    use crate::store::{Batch, RunDb};
    use crate::workflow::node;

    fn paused_run(db: &DbHandle, stage: Stage) -> Uuid {
        let mut run = Run::new(
            Uuid::new_v4(),
            NewRun {
                repo: "acme/widgets".into(),
                description: "Add audit logging".into(),
                signals: RiskSignals {
                    ambiguous_spec: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            2,
        );
        run.tasks = node::default_tasks();
        run.branch = "baton/run-feedface".into();
        run.pr_number = Some(31);
        run.stages.set(Stage::Dev, StageStatus::Done);
        run.stages.set(stage, StageStatus::Blocked);
        set_role_status(&mut run.tasks, stage.role(), TaskStatus::Blocked);
        run.record(stage.node(), Transition::Start, RunStatus::Running, None);
        run.blocked_reason = Some("HITL: repeated-test-failures".into());
        run.escalated = true;
        run.record(
            stage.node(),
            Transition::Blocked,
            RunStatus::AwaitingUnblock,
            Some("HITL: repeated-test-failures".into()),
        );
        let id = run.id;
        db.lock_sync()
            .unwrap()
            .insert_run(&run, Batch::default())
            .unwrap();
        id
    }

    fn db() -> DbHandle {
        DbHandle::new(RunDb::new_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_review_unblock_requeues_review() {
        let db = db();
        let id = paused_run(&db, Stage::Review);

        let outcome = unblock(&db, id).await.unwrap();
        assert_eq!(
            outcome,
            UnblockOutcome::Resumed {
                node: NodeName::Review,
                queue: QueueName::Review
            }
        );

        let run = db.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.phase, Phase::Review);
        assert_eq!(run.stages.review, StageStatus::Queued);
        assert_eq!(run.stages.ops, StageStatus::Pending);
        assert_eq!(run.stages.dev, StageStatus::Done);
        assert!(run.blocked_reason.is_none());
        assert!(!run.escalated);
        assert!(!run.signals.any());

        let types: Vec<String> = db
            .lock_sync()
            .unwrap()
            .list_events(id)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["hitl:unblocked", "hitl:resume_enqueued"]);

        let guard = db.lock_sync().unwrap();
        assert_eq!(guard.count_jobs(QueueName::Review, "ready").unwrap(), 1);
        let job = guard
            .claim_job(QueueName::Review, Duration::from_secs(60))
            .unwrap()
            .unwrap();
        assert_eq!(job.payload.branch.as_deref(), Some("baton/run-feedface"));
        assert_eq!(job.payload.pr_number, Some(31));
        assert!(guard.claim_job(QueueName::Review, Duration::from_secs(60)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_unblock_is_skipped() {
        let db = db();
        let id = paused_run(&db, Stage::Ops);
        unblock(&db, id).await.unwrap();
        let outcome = unblock(&db, id).await.unwrap();
        assert_eq!(
            outcome,
            UnblockOutcome::Skipped {
                status: RunStatus::Queued
            }
        );
        let guard = db.lock_sync().unwrap();
        assert_eq!(guard.count_jobs(QueueName::Ops, "ready").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let outcome = unblock(&db(), Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, UnblockOutcome::NotFound);
    }

    #[test]
    fn test_resume_targets() {
        assert_eq!(resume_target(Phase::Dev).1, QueueName::Dev);
        assert_eq!(resume_target(Phase::Report).1, QueueName::Dev);
        assert_eq!(resume_target(Phase::Review).1, QueueName::Review);
        assert_eq!(resume_target(Phase::Ops).1, QueueName::Ops);
        assert_eq!(resume_target(Phase::Plan), (NodeName::Plan, QueueName::Runs, None));
        assert_eq!(resume_target(Phase::Intake).0, NodeName::Intake);
    }
}
