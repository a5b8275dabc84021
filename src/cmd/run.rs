//! Workflow run commands: `runweave run`, `runweave emit`.

use anyhow::{Context, Result, bail};
use runweave::broker::GroupStart;
use runweave::config::Config;
use runweave::eventlog::RunMeta;
use runweave::ingest::{canonical_type, encode};
use runweave_common::{Event, EventKind, IssueRef, WorkflowType};
use serde_json::{Map, Value, json};

use super::super::RunCommands;
use super::{open_broker, open_log};

pub async fn cmd_run(config: &Config, command: RunCommands) -> Result<()> {
    let log = open_log(config)?;
    match command {
        RunCommands::Create {
            id,
            workflow_type,
            post_to_github,
            issue,
        } => {
            let workflow_type = workflow_type
                .parse::<WorkflowType>()
                .map_err(anyhow::Error::msg)?;
            let issue = issue
                .map(|s| s.parse::<IssueRef>().map_err(anyhow::Error::msg))
                .transpose()?;
            let meta = RunMeta {
                post_to_github: post_to_github.then_some(true),
                issue,
                created_at: None,
            };
            let run = log.create_run(&id, workflow_type, meta).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        RunCommands::Show { id } => {
            let run = log.get_run(&id).await?;
            let state = log.derive_state(&id).await?;
            let events = log.read_chain(&id).await?;
            let view = json!({
                "run": run,
                "state": state,
                "events": events,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        RunCommands::List { limit, issue } => {
            let runs = match issue {
                Some(issue) => {
                    let issue = issue.parse::<IssueRef>().map_err(anyhow::Error::msg)?;
                    log.runs_for_issue(issue).await?
                }
                None => log.list_runs(limit).await?,
            };
            if runs.is_empty() {
                println!("No runs found.");
                return Ok(());
            }
            for summary in runs {
                println!(
                    "{:<36} {:<20} {:<9} {:>4} events  {}",
                    summary.run.id,
                    summary.run.workflow_type.as_str(),
                    summary.state.as_str(),
                    summary.event_count,
                    summary.run.created_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

/// Write one event onto a run's stream. The ingest group is created first
/// so the entry is delivered even if no ingestor has joined the stream yet.
pub async fn cmd_emit(
    config: &Config,
    run_id: &str,
    event_type: &str,
    content: Option<String>,
    fields: &[String],
    stream: Option<&str>,
) -> Result<()> {
    let kind = event_kind(event_type, fields)?;
    let event = Event::new(kind, content);
    let stream = match stream {
        Some(key) => key.to_string(),
        None => config.toml.ingest.stream_for_run(run_id),
    };

    let broker = open_broker(config)?;
    broker
        .create_group(&stream, &config.toml.ingest.group, GroupStart::Latest)
        .await?;
    let id = broker.xadd(&stream, encode(run_id, &event)?).await?;
    tracing::debug!(stream = %stream, entry_id = %id, run_id, "event emitted");
    println!("{} {}", stream, id);
    Ok(())
}

fn event_kind(event_type: &str, fields: &[String]) -> Result<EventKind> {
    let Some(canonical) = canonical_type(event_type) else {
        bail!("Unknown event type '{}'", event_type);
    };
    let mut object = Map::new();
    object.insert("type".into(), Value::String(canonical.as_str().into()));
    for field in fields {
        let (key, value) = parse_field(field)?;
        object.insert(key, value);
    }
    serde_json::from_value(Value::Object(object))
        .with_context(|| format!("Invalid fields for a '{}' event", canonical.as_str()))
}

/// `key=value`; objects, arrays and booleans are taken as JSON, anything
/// else as a string.
fn parse_field(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        bail!("Empty field name in '{}'", raw);
    }
    let parsed = match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        v if v.starts_with('{') || v.starts_with('[') => serde_json::from_str(v)
            .with_context(|| format!("Field '{}' is not valid JSON", key))?,
        v => Value::String(v.to_string()),
    };
    Ok((key.to_string(), parsed))
}
