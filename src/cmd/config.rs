//! Configuration view and validation commands: `runweave config`.

use anyhow::{Result, bail};
use runweave::config::Config;

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Runweave Configuration");
            println!("======================");
            println!();
            match &config.source {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!(
                    "No config file found at {}; using defaults.",
                    config.default_config_path().display()
                ),
            }
            println!("Effective values (with env/CLI overrides):");
            println!();
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();
            println!("Resolved paths:");
            println!("  events = {}", config.events_path().display());
            println!("  broker = {}", config.broker_path().display());
            if let Some(dir) = config.log_directory() {
                println!("  logs   = {}", dir.display());
            }
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.toml.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
                return Ok(());
            }
            println!("Configuration problems:");
            for problem in &problems {
                println!("  - {}", problem);
            }
            bail!("{} configuration problem(s) found", problems.len());
        }
    }
    Ok(())
}
