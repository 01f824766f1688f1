//! The in-memory record of a turn currently executing against a session.
//!
//! Unlike the teacher's persisted `Run`/`RunNode` ledger (cost tracking,
//! node-by-node timing for a dashboard), this is purely the bookkeeping the
//! Stream Handler and the cancel handler need while the turn is live: it
//! never outlives the turn and is never written to disk.

use std::collections::{HashMap, HashSet};

use cro_domain::cancel::CancelToken;
use parking_lot::Mutex;

/// One turn's live state, shared between the Turn Runner, the Stream
/// Handler, and the Session Hub's cancel handler.
pub struct ActiveRun {
    pub turn_id: String,
    pub response_id: String,
    pub session_id: String,
    pub cancel: CancelToken,

    /// `call_id`s for which `tool_call_start` has been emitted but no
    /// `tool_result` yet — the "interrupted tool" synthesis set.
    active_tool_calls: Mutex<HashSet<String>>,
    tool_names: Mutex<HashMap<String, String>>,
    accumulated_text: Mutex<String>,
    thinking_text: Mutex<String>,
    thinking_started: Mutex<bool>,
    thinking_done: Mutex<bool>,
    /// Set when a `control{action:"cancel", target:"output"}` has landed.
    output_cancelled: Mutex<bool>,
    audio_end_ms: Mutex<Option<f64>>,
    input_offsets: Mutex<HashMap<String, usize>>,
    output_offsets: Mutex<HashMap<String, usize>>,
}

impl ActiveRun {
    pub fn new(session_id: impl Into<String>, turn_id: impl Into<String>, response_id: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            turn_id: turn_id.into(),
            response_id: response_id.into(),
            session_id: session_id.into(),
            cancel,
            active_tool_calls: Mutex::new(HashSet::new()),
            tool_names: Mutex::new(HashMap::new()),
            accumulated_text: Mutex::new(String::new()),
            thinking_text: Mutex::new(String::new()),
            thinking_started: Mutex::new(false),
            thinking_done: Mutex::new(false),
            output_cancelled: Mutex::new(false),
            audio_end_ms: Mutex::new(None),
            input_offsets: Mutex::new(HashMap::new()),
            output_offsets: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark_tool_call_started(&self, call_id: &str, tool_name: &str) {
        self.active_tool_calls.lock().insert(call_id.to_owned());
        self.tool_names.lock().insert(call_id.to_owned(), tool_name.to_owned());
        self.input_offsets.lock().insert(call_id.to_owned(), 0);
    }

    pub fn mark_tool_call_finished(&self, call_id: &str) {
        self.active_tool_calls.lock().remove(call_id);
    }

    /// The tool name recorded at `tool_call_start` for `call_id`, or an
    /// empty string if this call was never started (shouldn't happen given
    /// the ordering guarantee).
    pub fn tool_name_for(&self, call_id: &str) -> String {
        self.tool_names.lock().get(call_id).cloned().unwrap_or_default()
    }

    pub fn active_tool_call_ids(&self) -> Vec<String> {
        self.active_tool_calls.lock().iter().cloned().collect()
    }

    pub fn has_active_tool_calls(&self) -> bool {
        !self.active_tool_calls.lock().is_empty()
    }

    pub fn clear_active_tool_calls(&self) {
        self.active_tool_calls.lock().clear();
    }

    pub fn set_accumulated_text(&self, text: String) {
        *self.accumulated_text.lock() = text;
    }

    pub fn accumulated_text(&self) -> String {
        self.accumulated_text.lock().clone()
    }

    pub fn push_thinking(&self, delta: &str) {
        self.thinking_text.lock().push_str(delta);
    }

    pub fn thinking_text(&self) -> String {
        self.thinking_text.lock().clone()
    }

    pub fn latch_thinking_started(&self) -> bool {
        let mut started = self.thinking_started.lock();
        let already = *started;
        *started = true;
        already
    }

    pub fn latch_thinking_done(&self) -> bool {
        let mut done = self.thinking_done.lock();
        let already = *done;
        *done = true;
        already
    }

    pub fn set_output_cancelled(&self) {
        *self.output_cancelled.lock() = true;
    }

    pub fn output_cancelled(&self) -> bool {
        *self.output_cancelled.lock()
    }

    pub fn set_audio_end_ms(&self, ms: f64) {
        *self.audio_end_ms.lock() = Some(ms);
    }

    /// Advance the `call_id`'s input-chunk offset by `len` bytes and return
    /// the offset the chunk just emitted should be stamped with (the
    /// cumulative length of all earlier chunks).
    pub fn next_input_offset(&self, call_id: &str, len: usize) -> usize {
        let mut offsets = self.input_offsets.lock();
        let entry = offsets.entry(call_id.to_owned()).or_insert(0);
        let offset = *entry;
        *entry += len;
        offset
    }

    pub fn next_output_offset(&self, call_id: &str, len: usize) -> usize {
        let mut offsets = self.output_offsets.lock();
        let entry = offsets.entry(call_id.to_owned()).or_insert(0);
        let offset = *entry;
        *entry += len;
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> ActiveRun {
        ActiveRun::new("s1", "t1", "r1", CancelToken::new())
    }

    #[test]
    fn tool_call_lifecycle() {
        let run = run();
        run.mark_tool_call_started("c1", "shell");
        assert!(run.has_active_tool_calls());
        assert_eq!(run.tool_name_for("c1"), "shell");
        run.mark_tool_call_finished("c1");
        assert!(!run.has_active_tool_calls());
    }

    #[test]
    fn offsets_accumulate() {
        let run = run();
        assert_eq!(run.next_output_offset("c1", 3), 0);
        assert_eq!(run.next_output_offset("c1", 2), 3);
        assert_eq!(run.next_output_offset("c1", 4), 5);
    }

    #[test]
    fn thinking_latches_are_idempotent() {
        let run = run();
        assert!(!run.latch_thinking_started());
        assert!(run.latch_thinking_started());
    }
}
