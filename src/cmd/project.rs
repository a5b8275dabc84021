//! Project initialization: `runweave init`.

use anyhow::Result;
use runweave::config::{Config, RunweaveToml};

use super::{open_broker, open_log};

pub fn cmd_init(config: &Config) -> Result<()> {
    let config_path = config.default_config_path();
    let created_config = !config_path.exists();
    if created_config {
        RunweaveToml::default().save(&config_path)?;
    }

    // Opening runs the migrations.
    open_log(config)?;
    open_broker(config)?;
    tracing::info!(events = %config.events_path().display(), broker = %config.broker_path().display(), "stores ready");

    println!("Initialized runweave project at {}", config.project_dir.display());
    println!();
    if created_config {
        println!("  config:  {} (created)", config_path.display());
    } else {
        println!("  config:  {} (kept)", config_path.display());
    }
    println!("  events:  {}", config.events_path().display());
    println!("  broker:  {}", config.broker_path().display());
    println!();
    println!("Next steps:");
    println!("  1. `runweave run create <id> --type resolve_issue` to register a run");
    println!("  2. `runweave ingest` to persist events producers write to the streams");
    Ok(())
}
