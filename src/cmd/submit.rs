//! Run submission and human unblock: `baton submit`, `baton unblock`.

use anyhow::{Result, bail};
use baton::config::BatonConfig;
use baton::intake::submit_run;
use baton::unblock::{UnblockOutcome, unblock};
use baton_common::NewRun;
use console::style;
use uuid::Uuid;

use super::super::SubmitArgs;

pub async fn cmd_submit(config: &BatonConfig, args: &SubmitArgs) -> Result<()> {
    let db = super::open_handle(config)?;
    let allowlist = config.settings.allowlist();
    if !allowlist.allows(&args.repo) {
        println!(
            "{} {} is not in policy.allowed_repos; its phases will be refused",
            style("warning:").yellow().bold(),
            args.repo
        );
    }

    let request = NewRun {
        repo: args.repo.clone(),
        description: args.description.clone(),
        title: args.title.clone(),
        branch: args.branch.clone(),
        source: args.source.clone(),
        signals: (&args.signals).into(),
    };
    let run = submit_run(&db, request, config.settings.workflow.max_iterations).await?;

    println!("{} run {}", style("Queued").green().bold(), run.id);
    println!("  repo:   {}", run.repo);
    println!("  branch: {}", run.branch);
    if run.signals.any() {
        println!("  {}", style("risk signals raised at intake").yellow());
    }
    Ok(())
}

pub async fn cmd_unblock(config: &BatonConfig, run_id: Uuid) -> Result<()> {
    let db = super::open_handle(config)?;
    match unblock(&db, run_id).await? {
        UnblockOutcome::NotFound => bail!("Run {} not found", run_id),
        UnblockOutcome::Skipped { status } => {
            println!(
                "Run {} is {}, not awaiting unblock. Nothing to do.",
                run_id,
                style(status).dim()
            );
        }
        UnblockOutcome::Resumed { node, queue } => {
            println!(
                "{} run {} at {} (queue: {})",
                style("Resumed").green().bold(),
                run_id,
                node,
                queue
            );
        }
    }
    Ok(())
}
