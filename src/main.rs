use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use runweave::config::{Config, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "runweave")]
#[command(version, about = "Execution tracking and coordination for issue-resolution agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a runweave.toml (defaults to .runweave/runweave.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format: pretty, json
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the event and broker databases and a default config file
    Init,
    /// Consume run events from the broker streams into the event log
    Ingest {
        /// Consumer name within the group (defaults to host-pid-random)
        #[arg(long)]
        consumer: Option<String>,

        /// Replay pending entries and read one batch, then exit
        #[arg(long)]
        once: bool,
    },
    /// Run the single worker that drains the LLM request queue
    QueueWorker,
    /// Inspect the LLM request queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Create and inspect workflow runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Write an event onto a run's stream, as a workflow executor would
    Emit {
        run_id: String,

        /// Event type, e.g. status, assistant_response, workflow_state
        #[arg(long = "type")]
        event_type: String,

        #[arg(long)]
        content: Option<String>,

        /// Extra event fields as key=value (value parsed as JSON when possible)
        #[arg(long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,

        /// Stream key (defaults to the run's configured stream)
        #[arg(long)]
        stream: Option<String>,
    },
    /// Get a credential through the singleton refresh lock
    Token {
        /// Subject the credential belongs to (e.g. a user or installation id)
        subject: String,

        /// Store this refresh token for the subject before fetching
        #[arg(long)]
        seed_refresh_token: Option<String>,

        /// Drop the cached credential first, forcing a refresh
        #[arg(long)]
        force: bool,
    },
    /// Show or validate the effective configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum RunCommands {
    /// Create a workflow run
    Create {
        id: String,

        /// Workflow type: resolve_issue, create_pull_request, review_pull_request, apply_review
        #[arg(long = "type")]
        workflow_type: String,

        #[arg(long)]
        post_to_github: bool,

        /// Issue the run works on, as owner/repo#N
        #[arg(long)]
        issue: Option<String>,
    },
    /// Print a run's event chain and derived state as JSON
    Show { id: String },
    /// List runs, newest first
    List {
        #[arg(long, default_value = "20")]
        limit: i64,

        /// Only runs for this issue (owner/repo#N)
        #[arg(long)]
        issue: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum QueueCommands {
    /// Show token usage, backoff and queue depth as JSON
    Usage,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and report any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut config = Config::load(&project_dir, cli.config.as_deref(), cli.verbose)?;
    if let Some(format) = &cli.log_format {
        config.toml.logging.format = format.parse::<LogFormat>()?;
    }
    let _log_guard = runweave::telemetry::init(
        config.toml.logging.format,
        cli.verbose,
        config.log_directory().as_deref(),
    )?;

    match cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Ingest { consumer, once } => cmd::cmd_ingest(&config, consumer, once).await?,
        Commands::QueueWorker => cmd::cmd_queue_worker(&config).await?,
        Commands::Queue { command } => match command {
            QueueCommands::Usage => cmd::cmd_queue_usage(&config).await?,
        },
        Commands::Run { command } => cmd::cmd_run(&config, command).await?,
        Commands::Emit {
            run_id,
            event_type,
            content,
            fields,
            stream,
        } => {
            cmd::cmd_emit(
                &config,
                &run_id,
                &event_type,
                content,
                &fields,
                stream.as_deref(),
            )
            .await?
        }
        Commands::Token {
            subject,
            seed_refresh_token,
            force,
        } => cmd::cmd_token(&config, &subject, seed_refresh_token.as_deref(), force).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
