//! Stream entry envelopes.
//!
//! Producers write either
//!
//! ```text
//! event=<json event>  workflowId=<run id>
//! ```
//!
//! or a single `data` (or `payload`) field holding
//! `{"event": <json event or json-encoded string>, "workflowId": <run id>}`.
//! The run id may also be spelled `workflow_id`, `workflowRunId` or `runId`,
//! may sit inside the event itself, or is taken from a `workflow:<id>:events`
//! stream key.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use runweave_common::{Event, EventKind, EventType, WorkflowState};
use serde_json::{Map, Value};

use crate::broker::StreamEntry;
use crate::errors::IngestError;

const RUN_ID_KEYS: [&str; 4] = ["workflowId", "workflow_id", "workflowRunId", "runId"];

/// A decoded stream entry: the event to persist and the run it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub run_id: String,
    pub event: Event,
}

/// Producer side: the fields written onto a run's stream for `event`.
pub fn encode(run_id: &str, event: &Event) -> Result<BTreeMap<String, String>, serde_json::Error> {
    Ok(BTreeMap::from([
        ("event".to_string(), serde_json::to_string(event)?),
        ("workflowId".to_string(), run_id.to_string()),
    ]))
}

/// Decode a stream entry. The event's id becomes the entry id so that a
/// redelivered entry maps onto the same event.
pub fn decode(entry: &StreamEntry) -> Result<Envelope, IngestError> {
    let (event, run_id) = if let Some(raw) = entry.field("event") {
        let run_id = RUN_ID_KEYS
            .iter()
            .find_map(|k| entry.field(k))
            .map(str::to_string);
        (parse_object(raw, "event")?, run_id)
    } else if let Some(raw) = entry.field("data").or_else(|| entry.field("payload")) {
        let mut outer = parse_object(raw, "envelope")?;
        let run_id = run_id_in(&outer);
        let event = match outer.remove("event") {
            Some(Value::String(s)) => parse_object(&s, "event")?,
            Some(Value::Object(obj)) => obj,
            Some(_) => return Err(malformed("`event` must be an object or a JSON string")),
            None => return Err(malformed("envelope has no `event`")),
        };
        (event, run_id)
    } else {
        return Err(malformed("entry has neither an `event` nor a `data` field"));
    };

    let run_id = run_id
        .or_else(|| run_id_in(&event))
        .or_else(|| run_id_from_stream(&entry.stream))
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| malformed("no workflow id"))?;

    Ok(Envelope {
        run_id,
        event: into_event(event, entry.id.to_string())?,
    })
}

/// Map a producer tag onto an event type. Unknown tags yield `None`.
pub fn canonical_type(tag: &str) -> Option<EventType> {
    let tag = tag.trim().to_ascii_lowercase().replace(['.', '-', ' '], "_");
    let ty = match tag.as_str() {
        "status" | "workflow_status" => EventType::Status,
        "error" | "workflow_error" => EventType::Error,
        "workflow_state" | "state" => EventType::WorkflowState,
        "system_prompt" | "system" | "system_message" => EventType::SystemPrompt,
        "user_message" | "user" | "user_prompt" => EventType::UserMessage,
        "assistant_response" | "assistant" | "assistant_message" | "llm_response" => {
            EventType::AssistantResponse
        }
        "tool_call" | "tool_use" | "function_call" => EventType::ToolCall,
        "tool_result" | "tool_call_result" | "function_result" => EventType::ToolResult,
        "reasoning" | "thinking" => EventType::Reasoning,
        _ => return None,
    };
    Some(ty)
}

fn into_event(mut obj: Map<String, Value>, id: String) -> Result<Event, IngestError> {
    let tag = obj
        .remove("type")
        .or_else(|| obj.remove("eventType"))
        .ok_or_else(|| malformed("event has no `type`"))?;
    let tag = tag
        .as_str()
        .ok_or_else(|| malformed("event `type` is not a string"))?;
    let ty = canonical_type(tag).ok_or_else(|| malformed(format!("unknown event type '{}'", tag)))?;

    let content = match obj.remove("content") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    };
    let created_at = match obj.remove("createdAt").or_else(|| obj.remove("created_at")) {
        None | Some(Value::Null) => Utc::now(),
        Some(v) => parse_timestamp(&v)?,
    };
    obj.remove("id");

    let mut fields: Map<String, Value> = obj
        .into_iter()
        .map(|(k, v)| (camel_case(&k), v))
        .collect();
    if ty == EventType::WorkflowState
        && !fields.contains_key("state")
        && let Some(state) = content.as_deref().and_then(|c| c.parse::<WorkflowState>().ok())
    {
        fields.insert("state".into(), Value::String(state.as_str().into()));
    }
    fields.insert("type".into(), Value::String(ty.as_str().into()));

    let kind: EventKind = serde_json::from_value(Value::Object(fields))
        .map_err(|e| malformed(format!("invalid {} event: {}", ty, e)))?;
    Ok(Event {
        id,
        created_at,
        content,
        kind,
    })
}

fn parse_object(raw: &str, what: &str) -> Result<Map<String, Value>, IngestError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(malformed(format!("{} is not a JSON object", what))),
        Err(e) => Err(malformed(format!("{} is not valid JSON: {}", what, e))),
    }
}

fn parse_timestamp(v: &Value) -> Result<DateTime<Utc>, IngestError> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| malformed(format!("bad createdAt '{}': {}", s, e))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| malformed(format!("bad createdAt {}", n))),
        other => Err(malformed(format!("bad createdAt {}", other))),
    }
}

fn run_id_in(obj: &Map<String, Value>) -> Option<String> {
    RUN_ID_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn run_id_from_stream(stream: &str) -> Option<String> {
    stream
        .strip_prefix("workflow:")?
        .strip_suffix(":events")
        .map(str::to_string)
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn malformed(msg: impl Into<String>) -> IngestError {
    IngestError::Malformed(msg.into())
}
