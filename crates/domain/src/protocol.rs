//! Client-observable messages.
//!
//! `ServerMessage` is handed to a `ConnectionHandle` by the Stream Handler
//! and the Session Hub. The websocket transport that actually ships these
//! to a browser or client app is an external collaborator — this module
//! only fixes the wire shape and the trait a transport plugs into.

use serde::{Deserialize, Serialize};

use crate::event::ChatEvent;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TextDelta {
        response_id: String,
        delta: String,
    },
    TextDone {
        response_id: String,
        text: String,
    },
    ThinkingStart {
        response_id: String,
    },
    ThinkingDelta {
        response_id: String,
        delta: String,
    },
    ThinkingDone {
        response_id: String,
        text: String,
    },
    ToolCallStart {
        response_id: String,
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        response_id: String,
        call_id: String,
        tool_name: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorFrame>,
        #[serde(skip_serializing_if = "Option::is_none")]
        truncated: Option<bool>,
    },
    ChatEventMessage {
        session_id: String,
        event: ChatEvent,
    },
    UserMessage {
        session_id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_agent_id: Option<String>,
    },
    ChatOutputCancelled {
        session_id: String,
        response_id: String,
    },
    Error(ErrorFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
}

/// One live connection attached to a session. A websocket layer, a test
/// harness, or an in-process subscriber all implement this the same way.
pub trait ConnectionHandle: Send + Sync {
    /// Unique id for `broadcast_to_session_excluding`.
    fn id(&self) -> &str;
    /// Best-effort send; failures are swallowed by the caller (clients
    /// reconcile on reconnect).
    fn send(&self, message: &ServerMessage) -> bool;
}
