//! Long-running pipeline process: `baton serve`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use baton::codehost::{CodeHost, GitHubClient};
use baton::commands::ShellRunner;
use baton::config::BatonConfig;
use baton::driver::OrchestrationDriver;
use baton::hitl::HitlPolicy;
use baton::queue::{ConsumerSettings, JobHandler, QueueConsumer};
use baton::store::DbHandle;
use baton::workers::{CheckWork, DevWork, PhaseWork, PhaseWorker, WorkerSettings};
use baton_common::{NodeName, Stage};
use console::style;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Stages the workers own: those at or after the handoff node. With no
/// handoff the driver runs the whole graph and no stage worker starts.
fn worker_stages(handoff: Option<NodeName>) -> Vec<Stage> {
    let Some(handoff) = handoff else {
        return Vec::new();
    };
    [Stage::Dev, Stage::Review, Stage::Ops]
        .into_iter()
        .filter(|s| s.node().position() >= handoff.position())
        .collect()
}

fn stage_work(
    config: &BatonConfig,
    stage: Stage,
    host: Option<Arc<dyn CodeHost>>,
) -> Arc<dyn PhaseWork> {
    let settings = &config.settings;
    match settings.check(stage) {
        None => Arc::new(DevWork::new(host, settings.github.token_env.clone())),
        Some(check) => Arc::new(CheckWork::new(
            stage,
            check.command.clone(),
            settings.status_context(stage),
            ShellRunner::new(Duration::from_secs(check.timeout_secs)),
            host,
        )),
    }
}

fn build_handlers(config: &BatonConfig, db: &DbHandle) -> Result<Vec<Arc<dyn JobHandler>>> {
    let settings = &config.settings;
    let policy = HitlPolicy::new(settings.hitl.failed_attempt_threshold);
    let handoff = settings.workflow.handoff_node()?;

    let host: Option<Arc<dyn CodeHost>> = match config.github_token() {
        Some(token) => Some(Arc::new(GitHubClient::new(&settings.github.api_url, token)?)),
        None => {
            warn!(
                token_env = %settings.github.token_env,
                "no code host token, dev jobs will escalate for credentials"
            );
            None
        }
    };

    let mut worker_settings = WorkerSettings::new(settings.allowlist(), config.workspace_root());
    worker_settings.hitl = policy;
    worker_settings.output_limit = settings.limits.output_limit;

    let mut handlers: Vec<Arc<dyn JobHandler>> = Vec::new();
    handlers.push(Arc::new(OrchestrationDriver::new(
        db.clone(),
        policy,
        handoff,
    )));
    for stage in worker_stages(handoff) {
        handlers.push(Arc::new(PhaseWorker::new(
            stage,
            db.clone(),
            stage_work(config, stage, host.clone()),
            worker_settings.clone(),
        )));
    }
    Ok(handlers)
}

pub async fn cmd_serve(config: &BatonConfig) -> Result<()> {
    for warning in config.settings.warnings() {
        warn!("{}", warning);
    }
    let db = super::open_handle(config)?;
    let handlers = build_handlers(config, &db)?;
    let consumer_settings = ConsumerSettings::from_config(&config.settings.queues);

    let cancel = CancellationToken::new();
    let mut consumers = JoinSet::new();
    let queues: Vec<String> = handlers.iter().map(|h| h.queue().to_string()).collect();
    for handler in handlers {
        let consumer = QueueConsumer::new(db.clone(), handler, consumer_settings.clone());
        let token = cancel.clone();
        consumers.spawn(async move { consumer.run(token).await });
    }

    println!(
        "{} consuming {} from {}",
        style("baton").bold(),
        queues.join(", "),
        config.db_path().display()
    );
    println!("Press Ctrl-C to stop.");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("shutdown requested, finishing in-flight jobs");
        }
        Some(exited) = consumers.join_next() => {
            match exited {
                Ok(Ok(())) => warn!("a consumer stopped unexpectedly"),
                Ok(Err(e)) => error!("consumer failed: {:#}", e),
                Err(e) => error!("consumer task panicked: {}", e),
            }
        }
    }
    cancel.cancel();

    while let Some(exited) = consumers.join_next().await {
        match exited {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("consumer failed during shutdown: {:#}", e),
            Err(e) => error!("consumer task panicked: {}", e),
        }
    }
    info!("all consumers stopped");
    Ok(())
}
