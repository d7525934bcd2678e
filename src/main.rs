use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use baton::config::BatonConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "baton")]
#[command(version, about = "Queue-driven run orchestrator: plan, implement, review, verify")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to a baton.toml. Defaults to .baton/baton.toml in the project.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .baton/ with a default baton.toml and an empty database
    Init,
    /// Submit a run and queue it for the driver
    Submit(SubmitArgs),
    /// Run the driver and the dev, review and ops workers until Ctrl-C
    Serve,
    /// Resume a run paused for a human
    Unblock {
        run_id: Uuid,
    },
    /// Show one run with its step history, events and jobs
    Show {
        run_id: Uuid,
        /// Print the raw run record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent runs
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Walk the whole phase graph in memory and print every step
    Simulate(SimulateArgs),
}

#[derive(Args, Clone, Debug)]
pub struct SubmitArgs {
    /// Target repository as owner/name
    #[arg(short, long)]
    pub repo: String,

    /// What the run should accomplish
    #[arg(short, long)]
    pub description: String,

    #[arg(short, long)]
    pub title: Option<String>,

    /// Base branch (defaults to main)
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Where the request came from
    #[arg(long)]
    pub source: Option<String>,

    #[command(flatten)]
    pub signals: SignalArgs,
}

/// Intake risk flags.
#[derive(Args, Clone, Debug, Default)]
pub struct SignalArgs {
    #[arg(long)]
    pub missing_secret: bool,

    #[arg(long)]
    pub destructive_change: bool,

    #[arg(long)]
    pub ambiguous_spec: bool,
}

#[derive(Args, Clone, Debug)]
pub struct SimulateArgs {
    /// Dev attempts already used before the walk starts
    #[arg(long, default_value = "0")]
    pub dev_retries: u32,

    /// Iteration budget (defaults to workflow.max_iterations)
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Print steps as JSON lines
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub signals: SignalArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = BatonConfig::load(project_dir, cli.config.as_deref(), cli.verbose)?;
    let _logging = baton::logging::init(
        &config.settings.logging,
        config.log_dir().as_deref(),
        cli.verbose,
    )?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Submit(args) => cmd::cmd_submit(&config, args).await?,
        Commands::Serve => cmd::cmd_serve(&config).await?,
        Commands::Unblock { run_id } => cmd::cmd_unblock(&config, *run_id).await?,
        Commands::Show { run_id, json } => cmd::cmd_show(&config, *run_id, *json)?,
        Commands::List { limit } => cmd::cmd_list(&config, *limit)?,
        Commands::Simulate(args) => cmd::cmd_simulate(&config, args).await?,
    }

    Ok(())
}
