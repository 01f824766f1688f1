//! Normalizer for CLI C (a "pi"-shaped agent emitting `message_update`
//! envelopes wrapping an inner `assistantMessageEvent`).
//!
//! Tool output arrives as repeated full-buffer snapshots rather than
//! incremental deltas, so this normalizer reconstructs a delta by either a
//! strict prefix test or a trailing-overlap search over the last 8 KiB of
//! the previously seen chunk.

use std::collections::HashMap;

use cro_domain::stream::StreamEvent;
use serde_json::Value;

use super::FlavorNormalizer;

const OVERLAP_WINDOW: usize = 8192;

/// Computes the suffix of `new_full` not yet accounted for by `prev`.
///
/// Tries a strict prefix extension first; failing that, finds the longest
/// suffix of `prev` (bounded to the last [`OVERLAP_WINDOW`] bytes) that is
/// also a prefix of `new_full`, and returns what follows that overlap. If
/// no overlap is found, the whole of `new_full` is treated as new.
fn compute_output_delta(prev: &str, new_full: &str) -> String {
    if prev.is_empty() {
        return new_full.to_string();
    }
    if let Some(delta) = new_full.strip_prefix(prev) {
        return delta.to_string();
    }

    let window_start = prev.len().saturating_sub(OVERLAP_WINDOW);
    let mut window = &prev[window_start..];
    while !window.is_char_boundary(0) {
        window = &window[1..];
    }

    let max_k = window.len().min(new_full.len());
    for k in (1..=max_k).rev() {
        if !new_full.is_char_boundary(k) {
            continue;
        }
        let candidate_prefix = &new_full[..k];
        if window.ends_with(candidate_prefix) {
            return new_full[k..].to_string();
        }
    }
    new_full.to_string()
}

#[derive(Default)]
pub struct CliCState {
    cumulative_text: String,
    thinking_started: bool,
    tool_names: HashMap<String, String>,
    tool_output: HashMap<String, String>,
    active_tool_calls: HashMap<String, String>,
    session_id: Option<String>,
}

impl CliCState {
    pub fn cumulative_text(&self) -> &str {
        &self.cumulative_text
    }

    fn handle_event(&mut self, event: &Value, events: &mut Vec<StreamEvent>) {
        let kind = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match kind {
            "text_delta" => {
                if let Some(text) = event.get("text").and_then(|v| v.as_str()) {
                    self.cumulative_text.push_str(text);
                    events.push(StreamEvent::TextDelta {
                        delta: text.to_string(),
                        cumulative: self.cumulative_text.clone(),
                    });
                }
            }
            "thinking_start" => {
                if !self.thinking_started {
                    self.thinking_started = true;
                    events.push(StreamEvent::ThinkingStart);
                }
            }
            "thinking_delta" => {
                if let Some(text) = event.get("text").and_then(|v| v.as_str()) {
                    events.push(StreamEvent::ThinkingDelta {
                        delta: text.to_string(),
                    });
                }
            }
            "thinking_end" => {
                let text = event.get("text").and_then(|v| v.as_str()).unwrap_or("");
                events.push(StreamEvent::ThinkingDone {
                    text: text.to_string(),
                });
            }
            "tool_execution_start" => {
                if let (Some(id), Some(name)) = (
                    event.get("toolCallId").and_then(|v| v.as_str()),
                    event.get("name").and_then(|v| v.as_str()),
                ) {
                    self.tool_names.insert(id.to_string(), name.to_string());
                    self.tool_output.insert(id.to_string(), String::new());
                    self.active_tool_calls.insert(id.to_string(), name.to_string());
                    let args = event.get("args").cloned().unwrap_or_default();
                    events.push(StreamEvent::ToolCallStart {
                        call_id: id.to_string(),
                        tool_name: name.to_string(),
                        args_so_far: args.to_string(),
                    });
                }
            }
            "tool_execution_update" => {
                if let Some(id) = event.get("toolCallId").and_then(|v| v.as_str()) {
                    if let Some(chunk_full) = event.get("chunk").and_then(|v| v.as_str()) {
                        let prev = self.tool_output.entry(id.to_string()).or_default();
                        let delta = compute_output_delta(prev, chunk_full);
                        if !delta.is_empty() {
                            *prev = chunk_full.to_string();
                            let tool_name =
                                self.tool_names.get(id).cloned().unwrap_or_default();
                            events.push(StreamEvent::ToolOutputDelta {
                                call_id: id.to_string(),
                                tool_name,
                                chunk: delta,
                                stream: event
                                    .get("stream")
                                    .and_then(|v| v.as_str())
                                    .map(|s| s.to_string()),
                            });
                        }
                    }
                }
            }
            "tool_execution_end" => {
                if let Some(id) = event.get("toolCallId").and_then(|v| v.as_str()) {
                    self.active_tool_calls.remove(id);
                    let tool_name = self.tool_names.get(id).cloned().unwrap_or_default();
                    let ok = !event.get("isError").and_then(|v| v.as_bool()).unwrap_or(false);
                    let text = event
                        .pointer("/result/content")
                        .and_then(|v| v.as_array())
                        .map(|parts| {
                            parts
                                .iter()
                                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                                .collect::<Vec<_>>()
                                .join("")
                        })
                        .unwrap_or_default();
                    events.push(StreamEvent::ToolResult {
                        call_id: id.to_string(),
                        tool_name,
                        ok,
                        result: Value::String(text),
                        error: None,
                    });
                }
            }
            _ => {}
        }
    }
}

impl FlavorNormalizer for CliCState {
    fn normalize(&mut self, raw: Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if raw.get("type").and_then(|v| v.as_str()) == Some("session_header") {
            if let Some(id) = raw.get("sessionId").and_then(|v| v.as_str()) {
                self.session_id = Some(id.to_string());
                events.push(StreamEvent::SessionInfo {
                    session_id: id.to_string(),
                    cwd: raw.get("cwd").and_then(|v| v.as_str()).map(|s| s.to_string()),
                });
            }
            return events;
        }
        if raw.get("type").and_then(|v| v.as_str()) == Some("message_update") {
            if let Some(event) = raw.get("assistantMessageEvent") {
                self.handle_event(event, &mut events);
            }
        }
        events
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn active_tool_calls(&self) -> Vec<(String, String)> {
        self.active_tool_calls
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefix_extension_yields_suffix_only() {
        assert_eq!(compute_output_delta("hello", "hello world"), " world");
    }

    #[test]
    fn trailing_overlap_is_stitched() {
        let prev = "abcdefgh";
        let new_full = "fghijk";
        assert_eq!(compute_output_delta(prev, new_full), "ijk");
    }

    #[test]
    fn disjoint_chunk_treated_as_wholly_new() {
        assert_eq!(compute_output_delta("abc", "xyz"), "xyz");
    }

    #[test]
    fn tool_execution_update_emits_only_new_bytes() {
        let mut state = CliCState::default();
        let start = json!({
            "type": "message_update",
            "assistantMessageEvent": {"type": "tool_execution_start", "toolCallId": "tc1", "name": "shell", "args": {}}
        });
        state.normalize(start);

        let update1 = json!({
            "type": "message_update",
            "assistantMessageEvent": {"type": "tool_execution_update", "toolCallId": "tc1", "chunk": "line1\n"}
        });
        let events1 = state.normalize(update1);
        match &events1[0] {
            StreamEvent::ToolOutputDelta { chunk, .. } => assert_eq!(chunk, "line1\n"),
            _ => panic!("expected ToolOutputDelta"),
        }

        let update2 = json!({
            "type": "message_update",
            "assistantMessageEvent": {"type": "tool_execution_update", "toolCallId": "tc1", "chunk": "line1\nline2\n"}
        });
        let events2 = state.normalize(update2);
        match &events2[0] {
            StreamEvent::ToolOutputDelta { chunk, .. } => assert_eq!(chunk, "line2\n"),
            _ => panic!("expected ToolOutputDelta"),
        }
    }

    #[test]
    fn tool_execution_end_extracts_mcp_style_text() {
        let mut state = CliCState::default();
        let end = json!({
            "type": "message_update",
            "assistantMessageEvent": {
                "type": "tool_execution_end",
                "toolCallId": "tc1",
                "result": {"content": [{"type": "text", "text": "ok"}]}
            }
        });
        let events = state.normalize(end);
        match &events[0] {
            StreamEvent::ToolResult { result, ok, .. } => {
                assert!(*ok);
                assert_eq!(result, &Value::String("ok".to_string()));
            }
            _ => panic!("expected ToolResult"),
        }
    }
}
