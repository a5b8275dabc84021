use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::WorkflowState;

/// One immutable fact in a run's history.
///
/// `id` is globally unique. Events that arrive through a stream reuse the
/// stream entry identifier so that re-delivery maps onto the same node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// New event with a random id, stamped now.
    pub fn new(kind: EventKind, content: Option<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, content)
    }

    pub fn with_id(id: impl Into<String>, kind: EventKind, content: Option<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            content,
            kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// The declared state, if this is a `workflow_state` event.
    pub fn declared_state(&self) -> Option<WorkflowState> {
        match &self.kind {
            EventKind::WorkflowState { state } => Some(*state),
            _ => None,
        }
    }
}

/// Type-specific part of an event, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
    Status,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    WorkflowState {
        state: WorkflowState,
    },
    SystemPrompt,
    UserMessage,
    AssistantResponse,
    ToolCall {
        tool_name: String,
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<serde_json::Value>,
    },
    ToolResult {
        tool_name: String,
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Reasoning {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Status => EventType::Status,
            Self::Error { .. } => EventType::Error,
            Self::WorkflowState { .. } => EventType::WorkflowState,
            Self::SystemPrompt => EventType::SystemPrompt,
            Self::UserMessage => EventType::UserMessage,
            Self::AssistantResponse => EventType::AssistantResponse,
            Self::ToolCall { .. } => EventType::ToolCall,
            Self::ToolResult { .. } => EventType::ToolResult,
            Self::Reasoning { .. } => EventType::Reasoning,
        }
    }
}

/// The closed set of event types, without payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Status,
    Error,
    WorkflowState,
    SystemPrompt,
    UserMessage,
    AssistantResponse,
    ToolCall,
    ToolResult,
    Reasoning,
}

/// Secondary node label carried next to `Event`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventLabel {
    Message,
    Tool,
}

impl EventLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "Message",
            Self::Tool => "Tool",
        }
    }
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Error => "error",
            Self::WorkflowState => "workflow_state",
            Self::SystemPrompt => "system_prompt",
            Self::UserMessage => "user_message",
            Self::AssistantResponse => "assistant_response",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Reasoning => "reasoning",
        }
    }

    pub fn label(&self) -> Option<EventLabel> {
        match self {
            Self::SystemPrompt | Self::UserMessage | Self::AssistantResponse => {
                Some(EventLabel::Message)
            }
            Self::ToolCall | Self::ToolResult => Some(EventLabel::Tool),
            _ => None,
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "error" => Ok(Self::Error),
            "workflow_state" => Ok(Self::WorkflowState),
            "system_prompt" => Ok(Self::SystemPrompt),
            "user_message" => Ok(Self::UserMessage),
            "assistant_response" => Ok(Self::AssistantResponse),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "reasoning" => Ok(Self::Reasoning),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
