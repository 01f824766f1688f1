//! Normalizer for CLI A (a Claude-Code-shaped streaming JSON CLI).
//!
//! Wire shapes handled: `stream_event` envelopes carrying Anthropic-style
//! `content_block_start` / `content_block_delta` / `content_block_stop`
//! events, and full `assistant`/`user` message snapshots that restate the
//! whole turn's content array.

use std::collections::{HashMap, HashSet};

use cro_domain::stream::StreamEvent;
use serde_json::Value;

use super::FlavorNormalizer;

#[derive(Default)]
pub struct CliAState {
    cumulative_text: String,
    emitted_tool_calls: HashSet<String>,
    active_tool_calls: HashMap<String, String>,
    tool_args: HashMap<String, String>,
    current_tool_call_id: Option<String>,
    thinking_started: bool,
}

impl CliAState {
    pub fn cumulative_text(&self) -> &str {
        &self.cumulative_text
    }

    fn handle_stream_event(&mut self, event: &Value, events: &mut Vec<StreamEvent>) {
        let etype = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match etype {
            "content_block_start" => {
                if let Some(block) = event.get("content_block") {
                    if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                        if let (Some(id), Some(name)) = (
                            block.get("id").and_then(|v| v.as_str()),
                            block.get("name").and_then(|v| v.as_str()),
                        ) {
                            if self.emitted_tool_calls.insert(id.to_string()) {
                                self.current_tool_call_id = Some(id.to_string());
                                self.tool_args.insert(id.to_string(), String::new());
                                self.active_tool_calls.insert(id.to_string(), name.to_string());
                                events.push(StreamEvent::ToolCallStart {
                                    call_id: id.to_string(),
                                    tool_name: name.to_string(),
                                    args_so_far: String::new(),
                                });
                            }
                        }
                    }
                }
            }
            "content_block_delta" => {
                let delta = event.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            self.cumulative_text.push_str(text);
                            events.push(StreamEvent::TextDelta {
                                delta: text.to_string(),
                                cumulative: self.cumulative_text.clone(),
                            });
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                            if !self.thinking_started {
                                self.thinking_started = true;
                                events.push(StreamEvent::ThinkingStart);
                            }
                            events.push(StreamEvent::ThinkingDelta {
                                delta: text.to_string(),
                            });
                        }
                    }
                    "input_json_delta" => {
                        if let Some(call_id) = self.current_tool_call_id.clone() {
                            if let Some(partial) =
                                delta.get("partial_json").and_then(|v| v.as_str())
                            {
                                let cumulative = self.tool_args.entry(call_id.clone()).or_default();
                                cumulative.push_str(partial);
                                let cumulative = cumulative.clone();
                                events.push(StreamEvent::ToolInputDelta {
                                    call_id,
                                    args_delta: partial.to_string(),
                                    cumulative,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                self.current_tool_call_id = None;
            }
            _ => {}
        }
    }

    /// A full content-array snapshot. The CLI occasionally restates the
    /// whole assistant text with a whitespace rewrite that is not a strict
    /// prefix extension of what streamed so far; such updates are absorbed
    /// silently and reconciled only at `assistant_done`.
    fn handle_full_message(&mut self, content: &[Value], events: &mut Vec<StreamEvent>) {
        let mut full_text = String::new();
        for part in content {
            match part.get("type").and_then(|v| v.as_str()) {
                Some("text") => {
                    if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                        full_text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    if let (Some(id), Some(name)) = (
                        part.get("id").and_then(|v| v.as_str()),
                        part.get("name").and_then(|v| v.as_str()),
                    ) {
                        if self.emitted_tool_calls.insert(id.to_string()) {
                            let args = part.get("input").cloned().unwrap_or_default();
                            self.active_tool_calls.insert(id.to_string(), name.to_string());
                            events.push(StreamEvent::ToolCallStart {
                                call_id: id.to_string(),
                                tool_name: name.to_string(),
                                args_so_far: args.to_string(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        if full_text.is_empty() {
            return;
        }

        if let Some(delta) = full_text.strip_prefix(self.cumulative_text.as_str()) {
            if !delta.is_empty() {
                events.push(StreamEvent::TextDelta {
                    delta: delta.to_string(),
                    cumulative: full_text.clone(),
                });
            }
        }
        self.cumulative_text = full_text;
    }

    fn handle_tool_results(&mut self, content: &[Value], events: &mut Vec<StreamEvent>) {
        for part in content {
            if part.get("type").and_then(|v| v.as_str()) == Some("tool_result") {
                if let Some(id) = part.get("tool_use_id").and_then(|v| v.as_str()) {
                    let ok = !part.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
                    let result = part.get("content").cloned().unwrap_or(Value::Null);
                    self.active_tool_calls.remove(id);
                    events.push(StreamEvent::ToolResult {
                        call_id: id.to_string(),
                        tool_name: String::new(),
                        ok,
                        result,
                        error: None,
                    });
                    self.current_tool_call_id = None;
                }
            }
        }
    }
}

impl FlavorNormalizer for CliAState {
    fn active_tool_calls(&self) -> Vec<(String, String)> {
        self.active_tool_calls
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn normalize(&mut self, raw: Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match raw.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "stream_event" => {
                if let Some(event) = raw.get("event") {
                    self.handle_stream_event(event, &mut events);
                }
            }
            "assistant" => {
                if let Some(content) = raw.pointer("/message/content").and_then(|v| v.as_array()) {
                    self.handle_full_message(content, &mut events);
                }
            }
            "user" => {
                if let Some(content) = raw.pointer("/message/content").and_then(|v| v.as_array()) {
                    self.handle_tool_results(content, &mut events);
                }
            }
            _ => {}
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_delta_via_stream_event() {
        let mut state = CliAState::default();
        let raw = json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": {"type": "text_delta", "text": "hi"}
            }
        });
        let events = state.normalize(raw);
        assert!(matches!(events[0], StreamEvent::TextDelta { .. }));
        assert_eq!(state.cumulative_text(), "hi");
    }

    #[test]
    fn tool_use_deduplicated_across_snapshots() {
        let mut state = CliAState::default();
        let raw = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": "t1", "name": "shell", "input": {"cmd": "ls"}}
            ]}
        });
        let events = state.normalize(raw.clone());
        assert_eq!(events.len(), 1);
        let events2 = state.normalize(raw);
        assert!(events2.is_empty());
    }

    #[test]
    fn non_prefix_rewrite_is_absorbed_silently() {
        let mut state = CliAState::default();
        let first = json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "Hello  world"}]}
        });
        let events = state.normalize(first);
        assert_eq!(events.len(), 1);

        let second = json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "Hello world"}]}
        });
        let events2 = state.normalize(second);
        assert!(events2.is_empty());
        assert_eq!(state.cumulative_text(), "Hello world");
    }

    #[test]
    fn tool_result_emits_with_ok_flag() {
        let mut state = CliAState::default();
        let raw = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "done", "is_error": false}
            ]}
        });
        let events = state.normalize(raw);
        match &events[0] {
            StreamEvent::ToolResult { call_id, ok, .. } => {
                assert_eq!(call_id, "t1");
                assert!(*ok);
            }
            _ => panic!("expected ToolResult"),
        }
    }
}
