//! Normalizer for CLI B (a Codex-CLI-shaped JSON-lines agent).
//!
//! Wire shapes handled: `thread.started` / `session_configured` /
//! `session_meta` events carrying the provider-native session id,
//! `item.started` / `item.completed` events describing command
//! executions, reasoning and assistant-message items.

use cro_domain::stream::StreamEvent;
use serde_json::{json, Value};

use super::FlavorNormalizer;

#[derive(Default)]
pub struct CliBState {
    cumulative_text: String,
    session_id: Option<String>,
    thinking_started: bool,
    active_tool_calls: std::collections::HashMap<String, String>,
}

impl CliBState {
    pub fn cumulative_text(&self) -> &str {
        &self.cumulative_text
    }

    fn capture_session_id(&mut self, raw: &Value) {
        let candidate = raw
            .pointer("/thread_id")
            .or_else(|| raw.pointer("/session_id"))
            .or_else(|| raw.pointer("/payload/session_id"))
            .or_else(|| raw.pointer("/payload/id"))
            .and_then(|v| v.as_str());
        if let Some(id) = candidate {
            self.session_id = Some(id.to_string());
        }
    }

    fn handle_item(&mut self, item: &Value, completed: bool, events: &mut Vec<StreamEvent>) {
        let item_type = item.get("item_type").and_then(|v| v.as_str()).unwrap_or("");
        let id = item
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        match item_type {
            "command_execution" => {
                if !completed {
                    let command = item.get("command").and_then(|v| v.as_str()).unwrap_or("");
                    self.active_tool_calls.insert(id.clone(), "shell".to_string());
                    events.push(StreamEvent::ToolCallStart {
                        call_id: id,
                        tool_name: "shell".to_string(),
                        args_so_far: json!({ "command": command }).to_string(),
                    });
                } else {
                    let output = item.get("aggregated_output").and_then(|v| v.as_str()).unwrap_or("");
                    let exit_code = item.get("exit_code").and_then(|v| v.as_i64()).unwrap_or(-1);
                    self.active_tool_calls.remove(&id);
                    events.push(StreamEvent::ToolResult {
                        call_id: id,
                        tool_name: "shell".to_string(),
                        ok: exit_code == 0,
                        result: json!({ "output": output, "exitCode": exit_code }),
                        error: None,
                    });
                }
            }
            "reasoning" => {
                if completed {
                    let text = item.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    if !self.thinking_started {
                        self.thinking_started = true;
                        events.push(StreamEvent::ThinkingStart);
                    }
                    events.push(StreamEvent::ThinkingDelta {
                        delta: text.to_string(),
                    });
                    events.push(StreamEvent::ThinkingDone {
                        text: text.to_string(),
                    });
                }
            }
            "agent_message" => {
                if completed {
                    let text = item.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    let delta = format!("{text}\n\n");
                    self.cumulative_text.push_str(&delta);
                    events.push(StreamEvent::TextDelta {
                        delta,
                        cumulative: self.cumulative_text.clone(),
                    });
                }
            }
            _ => {}
        }
    }
}

impl FlavorNormalizer for CliBState {
    fn normalize(&mut self, raw: Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match raw.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "thread.started" | "session_configured" | "session_meta" => {
                self.capture_session_id(&raw);
                events.push(StreamEvent::SessionInfo {
                    session_id: self.session_id.clone().unwrap_or_default(),
                    cwd: raw
                        .pointer("/payload/cwd")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                });
            }
            "item.started" => {
                if let Some(item) = raw.get("item") {
                    self.handle_item(item, false, &mut events);
                }
            }
            "item.completed" => {
                if let Some(item) = raw.get("item") {
                    self.handle_item(item, true, &mut events);
                }
            }
            _ => {}
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

/// Best-effort: after a clean exit, locate this session's own transcript
/// file under `$CODEX_HOME` (or `$HOME/.codex/sessions`) and rewrite its
/// leading `session_meta.payload.source` from `"exec"`/`"unknown"` to
/// `"cli"`, so downstream transcript readers see the session as driven by
/// this orchestrator. Any failure here is swallowed; it never blocks the
/// turn.
pub fn rewrite_session_transcript_source(session_id: &str) {
    let Some(dir) = sessions_dir() else { return };
    let Some(path) = newest_matching_file(&dir, session_id) else { return };
    let _ = try_rewrite(&path);
}

fn sessions_dir() -> Option<std::path::PathBuf> {
    if let Ok(codex_home) = std::env::var("CODEX_HOME") {
        return Some(std::path::PathBuf::from(codex_home).join("sessions"));
    }
    let home = std::env::var("HOME").ok()?;
    Some(std::path::PathBuf::from(home).join(".codex").join("sessions"))
}

fn newest_matching_file(dir: &std::path::Path, session_id: &str) -> Option<std::path::PathBuf> {
    let suffix = format!("{session_id}.jsonl");
    let entries = std::fs::read_dir(dir).ok()?;
    let mut newest: Option<(std::time::SystemTime, std::path::PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if !name.ends_with(&suffix) {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, p)| p)
}

fn try_rewrite(path: &std::path::Path) -> std::io::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.splitn(2, '\n');
    let first = lines.next().unwrap_or("");
    let rest = lines.next().unwrap_or("");

    let mut value: Value = match serde_json::from_str(first) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };
    if value.get("type").and_then(|v| v.as_str()) != Some("session_meta") {
        return Ok(());
    }
    let source = value.pointer("/payload/source").and_then(|v| v.as_str());
    if !matches!(source, Some("exec") | Some("unknown")) {
        return Ok(());
    }
    if let Some(payload) = value.get_mut("payload").and_then(|p| p.as_object_mut()) {
        payload.insert("source".to_string(), Value::String("cli".to_string()));
    }
    let rewritten_first = serde_json::to_string(&value)?;
    let new_content = if rest.is_empty() { rewritten_first } else { format!("{rewritten_first}\n{rest}") };
    std::fs::write(path, new_content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_id_captured_from_thread_started() {
        let mut state = CliBState::default();
        let raw = json!({"type": "thread.started", "thread_id": "th_123"});
        let events = state.normalize(raw);
        assert_eq!(state.session_id(), Some("th_123".to_string()));
        assert!(matches!(events[0], StreamEvent::SessionInfo { .. }));
    }

    #[test]
    fn command_execution_becomes_shell_tool_call() {
        let mut state = CliBState::default();
        let start = json!({
            "type": "item.started",
            "item": {"id": "cmd1", "item_type": "command_execution", "command": "ls -la"}
        });
        let events = state.normalize(start);
        match &events[0] {
            StreamEvent::ToolCallStart { tool_name, .. } => assert_eq!(tool_name, "shell"),
            _ => panic!("expected ToolCallStart"),
        }

        let done = json!({
            "type": "item.completed",
            "item": {"id": "cmd1", "item_type": "command_execution", "aggregated_output": "a\nb\n", "exit_code": 0}
        });
        let events2 = state.normalize(done);
        match &events2[0] {
            StreamEvent::ToolResult { ok, .. } => assert!(*ok),
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn agent_message_appends_trailing_blank_line() {
        let mut state = CliBState::default();
        let raw = json!({
            "type": "item.completed",
            "item": {"id": "m1", "item_type": "agent_message", "text": "done"}
        });
        let events = state.normalize(raw);
        match &events[0] {
            StreamEvent::TextDelta { delta, .. } => assert_eq!(delta, "done\n\n"),
            _ => panic!("expected TextDelta"),
        }
    }

    #[test]
    fn rewrite_source_flips_exec_to_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout-2024-01-01T00-00-00-sess42.jsonl");
        std::fs::write(
            &path,
            "{\"type\":\"session_meta\",\"payload\":{\"id\":\"sess42\",\"source\":\"exec\"}}\n{\"type\":\"other\"}\n",
        )
        .unwrap();

        let found = newest_matching_file(dir.path(), "sess42").unwrap();
        assert_eq!(found, path);
        try_rewrite(&found).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let first: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["payload"]["source"], "cli");
        assert!(content.contains("\"type\":\"other\""));
    }

    #[test]
    fn rewrite_leaves_non_session_meta_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout-sess7.jsonl");
        std::fs::write(&path, "{\"type\":\"other\"}\n").unwrap();
        try_rewrite(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"type\":\"other\"}\n");
    }
}
