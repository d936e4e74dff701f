//! Push vocabulary for live session viewers.
//!
//! Internal events are reduced to a handful of named messages plus a
//! coarse [`Phase`] signal. Kinds without a dedicated message travel under
//! [`ServerMessage::Event`] so nothing new is silently dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use session_relay_core::{Event, EventKind};

/// Coarse activity signal a client can render without knowing event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Run accepted, waiting on the model.
    Initializing,
    /// Model output is arriving.
    Streaming,
    /// A tool call is in flight.
    ExecutingTool,
    /// Nothing running.
    Idle,
}

/// Message from server to live subscribers.
///
/// Serialized as `{ "type": <name>, "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The user's input for a run.
    Query { text: String },
    /// A complete assistant message.
    Answer {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_final: bool,
    },
    /// Incremental assistant output.
    AnswerDelta { text: String },
    /// Model reasoning, complete or incremental.
    Thinking { text: String, streaming: bool },
    ToolCall {
        tool_call_id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        content: Value,
    },
    /// Plan lifecycle; `stage` is `start`, `update` or `finish`.
    Plan { stage: String, payload: Value },
    /// Error surfaced by the agent or the session wrapper.
    Error { code: String, message: String },
    /// Phase change.
    Status { phase: Phase },
    /// The session was cleaned up; no further messages follow.
    Closed { session_id: String },
    /// Catch-all for every other event, forwarded verbatim.
    Event(Event),
}

impl ServerMessage {
    /// Channel name, identical to the serialized `type` tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::Answer { .. } => "answer",
            Self::AnswerDelta { .. } => "answer_delta",
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Plan { .. } => "plan",
            Self::Error { .. } => "error",
            Self::Status { .. } => "status",
            Self::Closed { .. } => "closed",
            Self::Event(_) => "event",
        }
    }
}

fn text(event: &Event) -> String {
    event.content().unwrap_or_default().to_owned()
}

fn field(event: &Event, key: &str) -> Value {
    event.payload.get(key).cloned().unwrap_or(Value::Null)
}

fn plan(stage: &str, event: &Event) -> ServerMessage {
    ServerMessage::Plan {
        stage: stage.to_owned(),
        payload: Value::Object(event.payload.clone()),
    }
}

/// Convert an internal event to its push message.
#[must_use]
pub fn map_event(event: &Event) -> ServerMessage {
    match &event.kind {
        EventKind::UserMessage => ServerMessage::Query { text: text(event) },
        EventKind::AssistantMessage => ServerMessage::Answer {
            text: text(event),
            is_final: false,
        },
        EventKind::FinalAnswer => ServerMessage::Answer {
            text: text(event),
            is_final: true,
        },
        EventKind::AssistantStreamingMessage | EventKind::FinalAnswerStreaming => {
            ServerMessage::AnswerDelta { text: text(event) }
        }
        EventKind::AssistantThinkingMessage => ServerMessage::Thinking {
            text: text(event),
            streaming: false,
        },
        EventKind::AssistantStreamingThinkingMessage => ServerMessage::Thinking {
            text: text(event),
            streaming: true,
        },
        EventKind::ToolCall => ServerMessage::ToolCall {
            tool_call_id: event.str_field("toolCallId").unwrap_or_default().to_owned(),
            name: event.str_field("name").unwrap_or_default().to_owned(),
            arguments: field(event, "arguments"),
        },
        EventKind::ToolResult => ServerMessage::ToolResult {
            tool_call_id: event.str_field("toolCallId").unwrap_or_default().to_owned(),
            name: event.str_field("name").unwrap_or_default().to_owned(),
            content: field(event, "content"),
        },
        EventKind::PlanStart => plan("start", event),
        EventKind::PlanUpdate => plan("update", event),
        EventKind::PlanFinish => plan("finish", event),
        EventKind::System if event.is_error() => ServerMessage::Error {
            code: event.str_field("code").unwrap_or("AGENT_ERROR").to_owned(),
            message: event.str_field("message").unwrap_or_default().to_owned(),
        },
        _ => ServerMessage::Event(event.clone()),
    }
}

/// Phase implied by an event, if it implies one.
#[must_use]
pub fn phase_for(event: &Event) -> Option<Phase> {
    match &event.kind {
        EventKind::AgentRunStart | EventKind::UserMessage | EventKind::ToolResult => {
            Some(Phase::Initializing)
        }
        EventKind::AssistantStreamingMessage
        | EventKind::AssistantStreamingThinkingMessage
        | EventKind::AssistantStreamingToolCall
        | EventKind::FinalAnswerStreaming => Some(Phase::Streaming),
        EventKind::ToolCall => Some(Phase::ExecutingTool),
        EventKind::AgentRunEnd => Some(Phase::Idle),
        EventKind::System if event.is_error() => Some(Phase::Idle),
        _ => None,
    }
}
