//! Run inspection: `baton show`, `baton list`.

use anyhow::{Result, bail};
use baton::config::BatonConfig;
use baton_common::{Run, RunStatus, Stage, StepRecord, Transition};
use console::{StyledObject, style};
use uuid::Uuid;

fn status_style(status: RunStatus) -> StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        RunStatus::Completed => style(label).green(),
        RunStatus::Failed => style(label).red(),
        RunStatus::AwaitingUnblock => style(label).yellow(),
        RunStatus::Queued | RunStatus::Running => style(label).cyan(),
    }
}

fn step_line(index: usize, step: &StepRecord) -> String {
    let transition = match step.transition {
        Transition::Fail => style(step.transition.as_str()).red().to_string(),
        Transition::Blocked => style(step.transition.as_str()).yellow().to_string(),
        Transition::Start | Transition::Complete => step.transition.as_str().to_string(),
    };
    let mut line = format!(
        "{:>3}  {:<12} {:<9} {:<17} {:<7} {}",
        index + 1,
        step.node.as_str(),
        transition,
        step.status.as_str(),
        step.phase.as_str(),
        step.retries
    );
    if let Some(reason) = &step.reason {
        line.push_str(&format!("  {}", style(reason).dim()));
    }
    line
}

fn ensure_initialized(config: &BatonConfig) -> Result<bool> {
    if config.db_path().exists() {
        return Ok(true);
    }
    println!();
    println!("No baton database found. Run 'baton init' first.");
    println!();
    Ok(false)
}

pub fn cmd_show(config: &BatonConfig, run_id: Uuid, json: bool) -> Result<()> {
    if !ensure_initialized(config)? {
        return Ok(());
    }
    let db = super::open_db(config)?;
    let Some(run) = db.get_run(run_id)? else {
        bail!("Run {} not found", run_id);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    print_summary(&run);

    println!();
    println!("{}", style("Steps").bold());
    if run.history.is_empty() {
        println!("  (none yet)");
    }
    for (i, step) in run.history.iter().enumerate() {
        println!("{}", step_line(i, step));
    }

    println!();
    println!("{}", style("Events").bold());
    for event in db.list_events(run_id)? {
        let mut line = format!(
            "  {}  {}",
            event.created_at.format("%H:%M:%S"),
            event.event_type
        );
        if let Some(reason) = &event.reason {
            line.push_str(&format!("  {}", style(reason).dim()));
        }
        println!("{}", line);
    }

    let jobs = db.list_jobs(run_id)?;
    if !jobs.is_empty() {
        println!();
        println!("{}", style("Jobs").bold());
        for job in jobs {
            let mut line = format!(
                "  #{:<5} {:<7} {:<7} {}/{}",
                job.id,
                job.queue.as_str(),
                job.state,
                job.attempts,
                job.max_attempts
            );
            if let Some(err) = &job.last_error {
                line.push_str(&format!("  {}", style(err).dim()));
            }
            println!("{}", line);
        }
    }
    println!();
    Ok(())
}

fn print_summary(run: &Run) {
    println!();
    println!("{} {}", style("Run").bold(), run.id);
    if let Some(title) = &run.title {
        println!("Title:     {}", title);
    }
    println!("Repo:      {} ({})", run.repo, run.branch);
    println!("Status:    {}", status_style(run.status));
    println!("Phase:     {} at {}", run.phase, run.current_node);
    println!("Iteration: {}/{}", run.iteration, run.max_iterations);
    println!("Retries:   {}", run.retries);
    println!(
        "Stages:    {}",
        [Stage::Dev, Stage::Review, Stage::Ops]
            .iter()
            .map(|s| format!("{}={}", s, run.stages.get(*s)))
            .collect::<Vec<_>>()
            .join(" ")
    );
    if let Some(pr) = run.pr_number {
        println!("PR:        #{}", pr);
    }
    if let Some(reason) = &run.blocked_reason {
        let label = if run.escalated { "escalated" } else { "paused" };
        println!("Blocked:   {} ({})", style(reason).yellow(), label);
    }
    if let Some(err) = &run.last_error {
        println!("Error:     {}", style(err).red());
    }
    if let Some(plan) = &run.plan_summary {
        println!("Plan:      {}", plan);
    }
}

pub fn cmd_list(config: &BatonConfig, limit: usize) -> Result<()> {
    if !ensure_initialized(config)? {
        return Ok(());
    }
    let runs = super::open_db(config)?.list_runs(limit)?;
    println!();
    if runs.is_empty() {
        println!("No runs yet. Submit one with 'baton submit'.");
        println!();
        return Ok(());
    }
    println!(
        "{:<10} {:<17} {:<7} {:<12} {:<24} Title",
        "Run", "Status", "Phase", "Node", "Repo"
    );
    println!(
        "{:<10} {:<17} {:<7} {:<12} {:<24} -----",
        "--------", "------", "-----", "----", "----"
    );
    for run in &runs {
        println!(
            "{:<10} {:<17} {:<7} {:<12} {:<24} {}",
            run.short_id(),
            status_style(run.status),
            run.phase.as_str(),
            run.current_node.as_str(),
            run.repo,
            run.title.as_deref().unwrap_or(&run.description)
        );
    }
    println!();
    Ok(())
}
