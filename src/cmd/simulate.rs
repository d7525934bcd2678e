//! Dry run of the phase graph: `baton simulate`.
//!
//! Walks the whole sequence in memory with no store, queues or code host,
//! printing each step as the executor emits it.

use anyhow::Result;
use async_trait::async_trait;
use baton::config::BatonConfig;
use baton::hitl::HitlPolicy;
use baton::workflow::{ExecutorInput, Outcome, StepObserver, WorkflowExecutor, WorkflowState};
use baton_common::{NewRun, Retries, Role, Run, StepRecord, Transition};
use console::style;
use uuid::Uuid;

use super::super::SimulateArgs;

struct PrintSteps {
    json: bool,
    count: usize,
}

#[async_trait]
impl StepObserver for PrintSteps {
    async fn on_step(
        &mut self,
        step: &StepRecord,
        _state: &WorkflowState,
        _steps: &[StepRecord],
    ) -> Result<()> {
        self.count += 1;
        if self.json {
            println!("{}", serde_json::to_string(step)?);
            return Ok(());
        }
        let transition = match step.transition {
            Transition::Fail => style(step.transition.as_str()).red(),
            Transition::Blocked => style(step.transition.as_str()).yellow(),
            Transition::Complete => style(step.transition.as_str()).green(),
            Transition::Start => style(step.transition.as_str()).dim(),
        };
        let mut line = format!(
            "{:>3}  {:<12} {:<9} {:<17} {}",
            self.count,
            step.node.as_str(),
            transition,
            step.status.as_str(),
            step.retries
        );
        if let Some(reason) = &step.reason {
            line.push_str(&format!("  {}", reason));
        }
        println!("{}", line);
        Ok(())
    }
}

pub async fn cmd_simulate(config: &BatonConfig, args: &SimulateArgs) -> Result<()> {
    let max_iterations = args
        .max_iterations
        .unwrap_or(config.settings.workflow.max_iterations);
    let run = Run::new(
        Uuid::new_v4(),
        NewRun {
            repo: "simulated/repo".into(),
            description: "Simulated run".into(),
            signals: (&args.signals).into(),
            ..Default::default()
        },
        max_iterations,
    );
    let mut retries = Retries::default();
    retries.set(Role::Dev, args.dev_retries);

    let executor = WorkflowExecutor::new(HitlPolicy::new(
        config.settings.hitl.failed_attempt_threshold,
    ));
    let mut printer = PrintSteps {
        json: args.json,
        count: 0,
    };
    let result = executor
        .execute(ExecutorInput::for_run(&run).with_retries(retries), &mut printer)
        .await?;

    if args.json {
        return Ok(());
    }
    let label = match &result.outcome {
        Outcome::Completed => style("completed".to_string()).green().bold(),
        Outcome::Failed { reason } => style(format!("failed: {}", reason)).red().bold(),
        Outcome::Escalated(reason) => {
            style(format!("escalated: {}", reason.as_str())).yellow().bold()
        }
        other => style(other.label().to_string()).bold(),
    };
    println!();
    println!(
        "Outcome: {} after {} steps, iteration {}/{}",
        label, result.new_steps, result.state.iteration, result.state.max_iterations
    );
    Ok(())
}
