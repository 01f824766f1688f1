use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for Reader output.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// The normalized, provider-agnostic event shape yielded by both the CLI
/// Stream Reader and the HTTP Stream Reader.
///
/// Readers MUST emit `ToolCallStart` before any `ToolInputDelta` or
/// `ToolResult` for the same `call_id`; `ToolResult` MUST terminate an
/// active call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "text_delta")]
    TextDelta { delta: String, cumulative: String },

    #[serde(rename = "thinking_start")]
    ThinkingStart,

    #[serde(rename = "thinking_delta")]
    ThinkingDelta { delta: String },

    #[serde(rename = "thinking_done")]
    ThinkingDone { text: String },

    #[serde(rename = "tool_call_start")]
    ToolCallStart {
        call_id: String,
        tool_name: String,
        args_so_far: String,
    },

    #[serde(rename = "tool_input_delta")]
    ToolInputDelta {
        call_id: String,
        args_delta: String,
        cumulative: String,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        tool_name: String,
        ok: bool,
        result: serde_json::Value,
        /// `(code, message)` for a call that failed rather than returned a
        /// value. Readers set this only for synthesized results (e.g. a
        /// tool call still open when its subprocess was killed).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<(String, String)>,
    },

    #[serde(rename = "tool_output_delta")]
    ToolOutputDelta {
        call_id: String,
        tool_name: String,
        chunk: String,
        stream: Option<String>,
    },

    #[serde(rename = "session_info")]
    SessionInfo {
        session_id: String,
        cwd: Option<String>,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

/// Token usage for a completion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
