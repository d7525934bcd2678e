//! End-to-end pipeline tests
//!
//! Intake, the driver and the three phase workers share one in-memory store
//! and are stepped one delivery at a time through their queue consumers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use baton::codehost::{CodeHost, CommitState};
use baton::commands::ShellRunner;
use baton::config::RepoAllowlist;
use baton::driver::OrchestrationDriver;
use baton::errors::CodeHostError;
use baton::hitl::HitlPolicy;
use baton::intake::submit_run;
use baton::queue::{ConsumerSettings, QueueConsumer};
use baton::store::{DbHandle, RunDb};
use baton::unblock::{UnblockOutcome, unblock};
use baton::workers::{CheckWork, DevWork, PhaseWork, PhaseWorker, WorkerSettings};
use baton_common::{
    NewRun, NodeName, Phase, QueueName, RiskSignals, Role, Run, RunStatus, Stage, StageStatus,
    TaskStatus, Transition,
};
use tempfile::TempDir;
use uuid::Uuid;

const REPO: &str = "acme/widgets";

/// Code host that accepts everything and remembers what was reported.
#[derive(Default)]
struct StubHost {
    statuses: Mutex<Vec<(String, CommitState)>>,
    comments: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl CodeHost for StubHost {
    async fn default_branch(&self, _repo: &str) -> Result<String, CodeHostError> {
        Ok("main".into())
    }

    async fn head_sha(&self, _repo: &str, _branch: &str) -> Result<String, CodeHostError> {
        Ok("0a1b2c3d".into())
    }

    async fn create_branch(&self, _: &str, _: &str, _: &str) -> Result<(), CodeHostError> {
        Ok(())
    }

    async fn commit_file(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<String, CodeHostError> {
        Ok("4e5f6a7b".into())
    }

    async fn open_pull_request(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
        _: &str,
    ) -> Result<i64, CodeHostError> {
        Ok(42)
    }

    async fn set_commit_status(
        &self,
        _repo: &str,
        _sha: &str,
        state: CommitState,
        context: &str,
        _description: &str,
    ) -> Result<(), CodeHostError> {
        self.statuses
            .lock()
            .unwrap()
            .push((context.to_string(), state));
        Ok(())
    }

    async fn comment(&self, _repo: &str, pr_number: i64, body: &str) -> Result<(), CodeHostError> {
        self.comments
            .lock()
            .unwrap()
            .push((pr_number, body.to_string()));
        Ok(())
    }
}

struct Pipeline {
    db: DbHandle,
    host: Arc<StubHost>,
    driver: QueueConsumer,
    dev: QueueConsumer,
    review: QueueConsumer,
    ops: QueueConsumer,
    scratch: TempDir,
}

fn consumer_settings() -> ConsumerSettings {
    ConsumerSettings {
        concurrency: 1,
        poll_interval: Duration::from_millis(10),
        lease: Duration::from_secs(60),
        backoff: Duration::ZERO,
    }
}

fn pipeline(review_command: &str, with_credentials: bool) -> Pipeline {
    let db = DbHandle::new(RunDb::new_in_memory().unwrap());
    let scratch = TempDir::new().unwrap();
    let host = Arc::new(StubHost::default());
    let code_host = with_credentials.then(|| host.clone() as Arc<dyn CodeHost>);

    let mut settings = WorkerSettings::new(
        RepoAllowlist::new([REPO]),
        scratch.path().join("workspaces"),
    );
    settings.hitl = HitlPolicy::new(2);

    let worker = |stage: Stage, work: Arc<dyn PhaseWork>| {
        QueueConsumer::new(
            db.clone(),
            Arc::new(PhaseWorker::new(stage, db.clone(), work, settings.clone())),
            consumer_settings(),
        )
    };
    let check = |stage: Stage, command: &str| -> Arc<dyn PhaseWork> {
        Arc::new(CheckWork::new(
            stage,
            Some(command.to_string()),
            format!("baton/{}", stage),
            ShellRunner::new(Duration::from_secs(10)),
            code_host.clone(),
        ))
    };

    Pipeline {
        driver: QueueConsumer::new(
            db.clone(),
            Arc::new(OrchestrationDriver::new(
                db.clone(),
                HitlPolicy::new(2),
                Some(NodeName::DevExecute),
            )),
            consumer_settings(),
        ),
        dev: worker(
            Stage::Dev,
            Arc::new(DevWork::new(code_host.clone(), "GITHUB_TOKEN")),
        ),
        review: worker(Stage::Review, check(Stage::Review, review_command)),
        ops: worker(Stage::Ops, check(Stage::Ops, "echo smoke ok")),
        db,
        host,
        scratch,
    }
}

impl Pipeline {
    async fn submit(&self, repo: &str, signals: RiskSignals) -> Uuid {
        let run = submit_run(
            &self.db,
            NewRun {
                repo: repo.into(),
                description: "Add audit logging".into(),
                title: Some("Audit logging".into()),
                signals,
                ..Default::default()
            },
            2,
        )
        .await
        .unwrap();
        run.id
    }

    async fn run(&self, id: Uuid) -> Run {
        self.db.get_run(id).await.unwrap().unwrap()
    }

    fn event_types(&self, id: Uuid) -> Vec<String> {
        self.db
            .lock_sync()
            .unwrap()
            .list_events(id)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    fn ready_jobs(&self, queue: QueueName) -> u64 {
        self.db
            .lock_sync()
            .unwrap()
            .count_jobs(queue, "ready")
            .unwrap()
    }
}

fn assert_projection_matches_history(run: &Run) {
    let last = run.history.last().expect("run has history");
    assert_eq!(run.status, last.status);
    assert_eq!(run.phase, last.phase);
    assert_eq!(run.current_node, last.current_node);
    assert_eq!(run.retries, last.retries);
}

#[tokio::test]
async fn test_run_flows_through_every_stage() {
    let p = pipeline("echo review ok", true);
    let id = p.submit(REPO, RiskSignals::default()).await;

    assert!(p.driver.run_once().await.unwrap());
    let run = p.run(id).await;
    assert_eq!(run.phase, Phase::Dev);
    assert_eq!(run.stages.dev, StageStatus::Queued);
    assert_eq!(p.ready_jobs(QueueName::Dev), 1);

    assert!(p.dev.run_once().await.unwrap());
    let run = p.run(id).await;
    assert_eq!(run.pr_number, Some(42));
    assert_eq!(run.branch, format!("baton/run-{}", run.short_id()));
    assert_eq!(run.phase, Phase::Review);

    assert!(p.review.run_once().await.unwrap());
    assert!(p.ops.run_once().await.unwrap());

    let run = p.run(id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.phase, Phase::Report);
    assert_eq!(run.current_node, NodeName::Report);
    assert_eq!(run.stages.dev, StageStatus::Done);
    assert_eq!(run.stages.review, StageStatus::Done);
    assert_eq!(run.stages.ops, StageStatus::Done);
    assert!(run.blocked_reason.is_none());
    for role in Role::ALL {
        assert_eq!(run.retries.get(role), 1, "{} retries", role);
    }
    assert!(run.tasks.iter().all(|t| t.status == TaskStatus::Done));
    assert_projection_matches_history(&run);

    let completed: Vec<NodeName> = run
        .history
        .iter()
        .filter(|s| s.transition == Transition::Complete)
        .map(|s| s.node)
        .collect();
    assert_eq!(
        completed,
        vec![
            NodeName::Intake,
            NodeName::Plan,
            NodeName::DevExecute,
            NodeName::Review,
            NodeName::Ops,
            NodeName::Report,
        ]
    );

    let events = p.event_types(id);
    assert_eq!(events.first().map(String::as_str), Some("run:queued"));
    assert_eq!(events.last().map(String::as_str), Some("run:completed"));
    assert!(events.contains(&"orchestrator:handoff".to_string()));

    let statuses = p.host.statuses.lock().unwrap().clone();
    assert!(statuses.contains(&("baton/review".to_string(), CommitState::Success)));
    assert!(statuses.contains(&("baton/ops".to_string(), CommitState::Success)));
    let comments = p.host.comments.lock().unwrap().clone();
    assert_eq!(comments.len(), 2);
    assert!(comments.iter().all(|(pr, _)| *pr == 42));

    for consumer in [&p.driver, &p.dev, &p.review, &p.ops] {
        assert!(!consumer.run_once().await.unwrap());
    }
    let jobs = p.db.lock_sync().unwrap().list_jobs(id).unwrap();
    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().all(|j| j.state == "done"));
}

#[tokio::test]
async fn test_repeated_review_failure_escalates_then_unblock_resumes() {
    let flag = TempDir::new().unwrap();
    let approved = flag.path().join("approved");
    let p = pipeline(&format!("test -f {}", approved.display()), true);
    let id = p.submit(REPO, RiskSignals::default()).await;

    assert!(p.driver.run_once().await.unwrap());
    assert!(p.dev.run_once().await.unwrap());

    // First failure is retried by the queue without a human.
    assert!(p.review.run_once().await.unwrap());
    let run = p.run(id).await;
    assert_eq!(run.status, RunStatus::AwaitingUnblock);
    assert!(!run.escalated);
    assert_eq!(run.blocked_reason.as_deref(), Some("review checks failed"));
    assert_eq!(p.ready_jobs(QueueName::Review), 1);

    // Second failure reaches the threshold.
    assert!(p.review.run_once().await.unwrap());
    let run = p.run(id).await;
    assert_eq!(run.status, RunStatus::AwaitingUnblock);
    assert!(run.escalated);
    assert_eq!(
        run.blocked_reason.as_deref(),
        Some("HITL: repeated-test-failures")
    );
    assert_eq!(run.stages.review, StageStatus::Blocked);
    assert_projection_matches_history(&run);
    assert!(!p.review.run_once().await.unwrap());
    let events = p.event_types(id);
    assert!(events.contains(&"hitl:pending".to_string()));
    assert!(events.contains(&"hitl:escalated".to_string()));

    std::fs::write(&approved, "yes").unwrap();
    let outcome = unblock(&p.db, id).await.unwrap();
    assert_eq!(
        outcome,
        UnblockOutcome::Resumed {
            node: NodeName::Review,
            queue: QueueName::Review
        }
    );
    let run = p.run(id).await;
    assert_eq!(run.stages.review, StageStatus::Queued);
    assert_eq!(p.ready_jobs(QueueName::Review), 1);

    assert!(p.review.run_once().await.unwrap());
    assert!(p.ops.run_once().await.unwrap());
    let run = p.run(id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert!(!run.escalated);
    assert_projection_matches_history(&run);
}

#[tokio::test]
async fn test_disallowed_repository_is_refused_once() {
    let p = pipeline("true", true);
    let id = p.submit("acme/secret-project", RiskSignals::default()).await;

    assert!(p.driver.run_once().await.unwrap());
    assert!(p.dev.run_once().await.unwrap());

    let run = p.run(id).await;
    assert_eq!(run.status, RunStatus::AwaitingUnblock);
    assert!(run.escalated);
    assert_eq!(run.blocked_reason.as_deref(), Some("Repo not allowed (dev)"));
    assert!(run.pr_number.is_none());

    let jobs = p.db.lock_sync().unwrap().list_jobs(id).unwrap();
    let dev_job = jobs
        .iter()
        .find(|j| j.queue == QueueName::Dev)
        .expect("dev job was enqueued");
    assert_eq!(dev_job.state, "dead");
    assert_eq!(dev_job.attempts, 1);
    assert!(!p.dev.run_once().await.unwrap());
}

#[tokio::test]
async fn test_missing_credentials_escalate_immediately() {
    let p = pipeline("true", false);
    let id = p.submit(REPO, RiskSignals::default()).await;

    assert!(p.driver.run_once().await.unwrap());
    assert!(p.dev.run_once().await.unwrap());

    let run = p.run(id).await;
    assert_eq!(run.status, RunStatus::AwaitingUnblock);
    assert!(run.escalated);
    assert_eq!(run.blocked_reason.as_deref(), Some("HITL: missing-secret"));
    assert_eq!(
        run.last_error.as_deref(),
        Some("Missing credential: GITHUB_TOKEN")
    );

    // The queue still holds a retry, but the escalated run ignores it.
    assert!(p.dev.run_once().await.unwrap());
    assert_eq!(p.run(id).await.history.len(), run.history.len());
}

#[tokio::test]
async fn test_ambiguous_request_pauses_in_plan_and_resumes_through_driver() {
    let p = pipeline("true", true);
    let id = p
        .submit(
            REPO,
            RiskSignals {
                ambiguous_spec: true,
                ..Default::default()
            },
        )
        .await;

    assert!(p.driver.run_once().await.unwrap());
    let run = p.run(id).await;
    assert_eq!(run.status, RunStatus::AwaitingUnblock);
    assert_eq!(run.phase, Phase::Plan);
    assert_eq!(run.blocked_reason.as_deref(), Some("hitl:ambiguous-spec"));
    assert_eq!(p.ready_jobs(QueueName::Dev), 0);

    let outcome = unblock(&p.db, id).await.unwrap();
    assert_eq!(
        outcome,
        UnblockOutcome::Resumed {
            node: NodeName::Plan,
            queue: QueueName::Runs
        }
    );

    assert!(p.driver.run_once().await.unwrap());
    let run = p.run(id).await;
    assert_eq!(run.phase, Phase::Dev);
    assert_eq!(p.ready_jobs(QueueName::Dev), 1);

    assert!(p.dev.run_once().await.unwrap());
    assert!(p.review.run_once().await.unwrap());
    assert!(p.ops.run_once().await.unwrap());
    assert_eq!(p.run(id).await.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_workspaces_are_removed_after_each_stage() {
    let p = pipeline("true", true);
    let id = p.submit(REPO, RiskSignals::default()).await;

    assert!(p.driver.run_once().await.unwrap());
    assert!(p.dev.run_once().await.unwrap());
    assert!(p.review.run_once().await.unwrap());

    let root = p.scratch.path().join("workspaces");
    let leftovers = if root.exists() {
        std::fs::read_dir(&root).unwrap().count()
    } else {
        0
    };
    assert_eq!(leftovers, 0);
    assert!(workspace_events_paired(&p.event_types(id)));
}

fn workspace_events_paired(events: &[String]) -> bool {
    let inits = events.iter().filter(|e| *e == "workspace:init").count();
    let cleanups = events.iter().filter(|e| *e == "workspace:cleanup").count();
    inits == 2 && inits == cleanups
}
