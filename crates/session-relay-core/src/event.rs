//! Session event vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::session::now_ms;

/// Kind tag carried by every event.
///
/// Serialized as its snake_case name. Tags this release does not know are
/// kept verbatim in `Other` so they survive a storage round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    UserMessage,
    AssistantMessage,
    AssistantStreamingMessage,
    AssistantThinkingMessage,
    AssistantStreamingThinkingMessage,
    AssistantStreamingToolCall,
    ToolCall,
    ToolResult,
    System,
    AgentRunStart,
    AgentRunEnd,
    FinalAnswer,
    FinalAnswerStreaming,
    PlanStart,
    PlanUpdate,
    PlanFinish,
    EnvironmentInput,
    Other(String),
}

impl EventKind {
    /// Every known kind, in declaration order.
    pub const KNOWN: [Self; 17] = [
        Self::UserMessage,
        Self::AssistantMessage,
        Self::AssistantStreamingMessage,
        Self::AssistantThinkingMessage,
        Self::AssistantStreamingThinkingMessage,
        Self::AssistantStreamingToolCall,
        Self::ToolCall,
        Self::ToolResult,
        Self::System,
        Self::AgentRunStart,
        Self::AgentRunEnd,
        Self::FinalAnswer,
        Self::FinalAnswerStreaming,
        Self::PlanStart,
        Self::PlanUpdate,
        Self::PlanFinish,
        Self::EnvironmentInput,
    ];

    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::UserMessage => "user_message",
            Self::AssistantMessage => "assistant_message",
            Self::AssistantStreamingMessage => "assistant_streaming_message",
            Self::AssistantThinkingMessage => "assistant_thinking_message",
            Self::AssistantStreamingThinkingMessage => "assistant_streaming_thinking_message",
            Self::AssistantStreamingToolCall => "assistant_streaming_tool_call",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::System => "system",
            Self::AgentRunStart => "agent_run_start",
            Self::AgentRunEnd => "agent_run_end",
            Self::FinalAnswer => "final_answer",
            Self::FinalAnswerStreaming => "final_answer_streaming",
            Self::PlanStart => "plan_start",
            Self::PlanUpdate => "plan_update",
            Self::PlanFinish => "plan_finish",
            Self::EnvironmentInput => "environment_input",
            Self::Other(name) => name,
        }
    }

    /// Whether this is a high-frequency incremental delta.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::AssistantStreamingMessage
                | Self::AssistantStreamingThinkingMessage
                | Self::AssistantStreamingToolCall
                | Self::FinalAnswerStreaming
        )
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        Self::KNOWN
            .iter()
            .find(|k| k.as_str() == name)
            .cloned()
            .unwrap_or(Self::Other(name))
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        Self::from(name.to_owned())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Immutable record of something that happened in a session.
///
/// The type-specific payload is flattened next to `id`, `type` and
/// `timestamp` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "new_event_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Create an event of the given kind stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<EventKind>) -> Self {
        Self {
            id: new_event_id(),
            kind: kind.into(),
            timestamp: now_ms(),
            payload: Map::new(),
        }
    }

    /// Add a payload field.
    ///
    /// The envelope keys (`id`, `type`, `timestamp`) are ignored.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !matches!(key.as_str(), "id" | "type" | "timestamp") {
            self.payload.insert(key, value.into());
        }
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub const fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn user_message(content: impl Into<String>) -> Self {
        Self::new(EventKind::UserMessage).with("content", content.into())
    }

    #[must_use]
    pub fn assistant_message(content: impl Into<String>) -> Self {
        Self::new(EventKind::AssistantMessage).with("content", content.into())
    }

    #[must_use]
    pub fn streaming_message(content: impl Into<String>) -> Self {
        Self::new(EventKind::AssistantStreamingMessage).with("content", content.into())
    }

    #[must_use]
    pub fn tool_call(tool_call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::new(EventKind::ToolCall)
            .with("toolCallId", tool_call_id.into())
            .with("name", name.into())
            .with("arguments", arguments)
    }

    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, name: impl Into<String>, content: Value) -> Self {
        Self::new(EventKind::ToolResult)
            .with("toolCallId", tool_call_id.into())
            .with("name", name.into())
            .with("content", content)
    }

    /// System event with a severity level (`info`, `warning`, `error`).
    #[must_use]
    pub fn system(level: &str, message: impl Into<String>) -> Self {
        Self::new(EventKind::System)
            .with("level", level)
            .with("message", message.into())
    }

    /// Placeholder for a stored event that could not be decoded.
    #[must_use]
    pub fn corrupt_placeholder(timestamp: i64, reason: &str) -> Self {
        Self::system("error", "Stored event could not be read")
            .with("details", json!({ "reason": reason }))
            .at(timestamp)
    }

    /// Terminal error event closing a failed run.
    #[must_use]
    pub fn terminal_error(code: &str, message: impl Into<String>) -> Self {
        Self::system("error", message).with("code", code)
    }

    /// String payload field.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// The `content` field, when it is a string.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        self.str_field("content")
    }

    /// Whether this is an error-level system event.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == EventKind::System && self.str_field("level") == Some("error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in EventKind::KNOWN {
            assert_eq!(EventKind::from(kind.as_str()), kind);
        }
        assert_eq!(
            EventKind::from("brand_new_kind"),
            EventKind::Other("brand_new_kind".into())
        );
    }

    #[test]
    fn test_wire_shape_is_flat() {
        let event = Event::user_message("hi").at(42);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user_message");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["timestamp"], 42);

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_unknown_kind_survives_parse() {
        let parsed: Event =
            serde_json::from_str(r#"{"type":"widget_update","timestamp":1,"size":3}"#).unwrap();
        assert_eq!(parsed.kind, EventKind::Other("widget_update".into()));
        assert_eq!(parsed.payload["size"], 3);
        assert!(!parsed.id.is_empty());
        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["type"], "widget_update");
    }

    #[test]
    fn test_envelope_keys_not_overwritten() {
        let event = Event::new(EventKind::System).with("type", "nope");
        assert_eq!(event.kind, EventKind::System);
        assert!(!event.payload.contains_key("type"));
    }

    #[test]
    fn test_streaming_kinds() {
        assert!(EventKind::AssistantStreamingMessage.is_streaming());
        assert!(EventKind::FinalAnswerStreaming.is_streaming());
        assert!(!EventKind::AssistantMessage.is_streaming());
        assert!(!EventKind::Other("x_streaming".into()).is_streaming());
    }

    #[test]
    fn test_error_helpers() {
        assert!(Event::terminal_error("ABORTED", "stopped").is_error());
        assert!(Event::corrupt_placeholder(5, "bad json").is_error());
        assert!(!Event::system("info", "ok").is_error());
    }
}
