use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ErrorFrame;

/// The on-the-wire persisted record appended to a session's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(flatten)]
    pub payload: ChatEventPayload,
}

impl ChatEvent {
    pub fn new(session_id: impl Into<String>, payload: ChatEventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id: session_id.into(),
            turn_id: None,
            response_id: None,
            payload,
        }
    }

    pub fn with_turn(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }

    pub fn with_response(mut self, response_id: impl Into<String>) -> Self {
        self.response_id = Some(response_id.into());
        self
    }

    /// Whether this event type is written to the append-only log, or is
    /// broadcast-only ("transient"). Matches the table in the component
    /// spec: `tool_input_chunk` and `tool_output_chunk` never persist.
    pub fn persisted(&self) -> bool {
        self.payload.persisted()
    }
}

/// The twelve recognized `ChatEvent` payload types. Every variant here is
/// reachable from exactly the producer named in the component spec's
/// lifecycle table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEventPayload {
    TurnStart { trigger: TurnTrigger },
    UserMessage { text: String },
    AssistantChunk { text: String },
    AssistantDone { text: String },
    ThinkingChunk { text: String },
    ThinkingDone { text: String },
    ToolCall { call_id: String, tool_name: String, arguments: serde_json::Value },
    ToolResult {
        call_id: String,
        tool_name: String,
        ok: bool,
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorFrame>,
    },
    ToolInputChunk { call_id: String, tool_name: String, chunk: String, offset: usize },
    ToolOutputChunk { call_id: String, tool_name: String, chunk: String, offset: usize },
    Interrupt { reason: String },
    TurnEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnTrigger {
    User,
    System,
    Callback,
}

impl ChatEventPayload {
    pub fn persisted(&self) -> bool {
        !matches!(
            self,
            ChatEventPayload::ToolInputChunk { .. } | ChatEventPayload::ToolOutputChunk { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::TurnStart { .. } => "turn_start",
            Self::UserMessage { .. } => "user_message",
            Self::AssistantChunk { .. } => "assistant_chunk",
            Self::AssistantDone { .. } => "assistant_done",
            Self::ThinkingChunk { .. } => "thinking_chunk",
            Self::ThinkingDone { .. } => "thinking_done",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolInputChunk { .. } => "tool_input_chunk",
            Self::ToolOutputChunk { .. } => "tool_output_chunk",
            Self::Interrupt { .. } => "interrupt",
            Self::TurnEnd => "turn_end",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_types_are_not_persisted() {
        let e = ChatEvent::new(
            "s1",
            ChatEventPayload::ToolInputChunk {
                call_id: "c1".into(),
                tool_name: "shell".into(),
                chunk: "ls".into(),
                offset: 0,
            },
        );
        assert!(!e.persisted());
        let e2 = ChatEvent::new(
            "s1",
            ChatEventPayload::ToolOutputChunk {
                call_id: "c1".into(),
                tool_name: "shell".into(),
                chunk: "a".into(),
                offset: 0,
            },
        );
        assert!(!e2.persisted());
    }

    #[test]
    fn persisted_types_are_persisted() {
        let e = ChatEvent::new("s1", ChatEventPayload::TurnEnd);
        assert!(e.persisted());
        let e2 = ChatEvent::new(
            "s1",
            ChatEventPayload::TurnStart {
                trigger: TurnTrigger::User,
            },
        );
        assert!(e2.persisted());
    }

    #[test]
    fn serializes_with_flattened_tag() {
        let e = ChatEvent::new("s1", ChatEventPayload::TurnEnd).with_turn("t1");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "turn_end");
        assert_eq!(v["session_id"], "s1");
        assert_eq!(v["turn_id"], "t1");
    }

    #[test]
    fn label_matches_serde_tag() {
        let e = ChatEventPayload::ToolCall {
            call_id: "c1".into(),
            tool_name: "shell".into(),
            arguments: serde_json::json!({}),
        };
        assert_eq!(e.label(), "tool_call");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "tool_call");
    }
}
