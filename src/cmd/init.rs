//! Project initialization: `baton init`.

use anyhow::{Context, Result};
use baton::config::{BatonConfig, BatonToml, CONFIG_FILE};
use console::style;

pub fn cmd_init(config: &BatonConfig) -> Result<()> {
    let baton_dir = config.baton_dir();
    std::fs::create_dir_all(&baton_dir)
        .with_context(|| format!("Failed to create {}", baton_dir.display()))?;

    let config_path = baton_dir.join(CONFIG_FILE);
    let created = if config_path.exists() {
        false
    } else {
        BatonToml::default().save(&config_path)?;
        true
    };
    super::open_db(config)?;

    println!();
    if created {
        println!(
            "{} baton project at {}",
            style("Initialized").green().bold(),
            baton_dir.display()
        );
        println!();
        println!("  .baton/");
        println!("  ├── baton.toml   # queues, policy, check commands, code host");
        println!("  └── baton.db     # runs, events and queued jobs");
        println!();
        println!("Next steps:");
        println!("  1. Add repositories to [policy] allowed_repos");
        println!("  2. Set [review] and [ops] commands");
        println!("  3. Run `baton serve`, then `baton submit --repo owner/name -d \"...\"`");
    } else {
        println!(
            "Baton project already initialized at {}",
            baton_dir.display()
        );
        println!("Database verified.");
    }

    let warnings = config.settings.warnings();
    if !warnings.is_empty() {
        println!();
        println!("{}", style("Configuration warnings:").yellow());
        for warning in warnings {
            println!("  - {}", warning);
        }
    }
    println!();
    Ok(())
}
