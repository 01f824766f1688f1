//! Translates normalized stream events into broadcasts and persisted
//! events, maintaining the per-turn accumulators on an [`ActiveRun`].
//!
//! An explicit struct closing over the turn's `ActiveRun`, `EventSink`, and
//! a broadcaster — not a bag of closures — matching the teacher's
//! preference for inspectable call graphs over ad hoc callback wiring.

use cro_domain::error::Result;
use cro_domain::event::{ChatEvent, ChatEventPayload};
use cro_domain::protocol::ServerMessage;
use cro_domain::stream::StreamEvent;
use cro_sessions::EventSink;

use super::active_run::ActiveRun;
use super::broadcaster::SessionBroadcaster;

pub struct StreamHandler<'a> {
    run: &'a ActiveRun,
    sink: &'a EventSink,
    broadcaster: &'a dyn SessionBroadcaster,
}

impl<'a> StreamHandler<'a> {
    pub fn new(run: &'a ActiveRun, sink: &'a EventSink, broadcaster: &'a dyn SessionBroadcaster) -> Self {
        Self { run, sink, broadcaster }
    }

    /// Route one normalized event. `SessionInfo` is intentionally not
    /// handled here — persisting a newly-observed provider session id
    /// back to session attributes is the Turn Runner's job, since only it
    /// holds the `SessionStore` handle.
    pub async fn handle(&self, event: &StreamEvent) -> Result<()> {
        match event {
            StreamEvent::TextDelta { delta, cumulative } => self.emit_text_delta(delta, cumulative).await,
            StreamEvent::ThinkingStart => self.emit_thinking_start().await,
            StreamEvent::ThinkingDelta { delta } => self.emit_thinking_delta(delta).await,
            StreamEvent::ThinkingDone { text } => self.emit_thinking_done(text).await,
            StreamEvent::ToolCallStart { call_id, tool_name, args_so_far } => {
                self.emit_tool_call_start(call_id, tool_name, args_so_far).await
            }
            StreamEvent::ToolInputDelta { call_id, args_delta, .. } => {
                self.emit_tool_input_chunk(call_id, args_delta).await
            }
            StreamEvent::ToolResult { call_id, tool_name, ok, result, error } => match error {
                Some((code, message)) => self.emit_tool_result_error(call_id, tool_name, code, message).await,
                None => self.emit_tool_result(call_id, tool_name, *ok, result.clone()).await,
            },
            StreamEvent::ToolOutputDelta { call_id, tool_name, chunk, .. } => {
                self.emit_tool_output_chunk(call_id, tool_name, chunk).await
            }
            StreamEvent::SessionInfo { .. } => Ok(()),
            StreamEvent::Error { code, message } => self.emit_error(code, message).await,
        }
    }

    pub async fn emit_text_delta(&self, delta: &str, cumulative: &str) -> Result<()> {
        self.run.set_accumulated_text(cumulative.to_owned());
        self.broadcaster.broadcast_to_session(
            &self.run.session_id,
            ServerMessage::TextDelta {
                response_id: self.run.response_id.clone(),
                delta: delta.to_owned(),
            },
        );
        self.persist(ChatEventPayload::AssistantChunk { text: delta.to_owned() }).await
    }

    pub async fn emit_thinking_start(&self) -> Result<()> {
        if self.run.latch_thinking_started() {
            return Ok(()); // idempotent: already started
        }
        self.broadcaster.broadcast_to_session(
            &self.run.session_id,
            ServerMessage::ThinkingStart { response_id: self.run.response_id.clone() },
        );
        Ok(())
    }

    pub async fn emit_thinking_delta(&self, delta: &str) -> Result<()> {
        self.emit_thinking_start().await?;
        self.run.push_thinking(delta);
        self.broadcaster.broadcast_to_session(
            &self.run.session_id,
            ServerMessage::ThinkingDelta {
                response_id: self.run.response_id.clone(),
                delta: delta.to_owned(),
            },
        );
        self.persist(ChatEventPayload::ThinkingChunk { text: delta.to_owned() }).await
    }

    pub async fn emit_thinking_done(&self, text: &str) -> Result<()> {
        if self.run.latch_thinking_done() {
            return Ok(());
        }
        self.broadcaster.broadcast_to_session(
            &self.run.session_id,
            ServerMessage::ThinkingDone {
                response_id: self.run.response_id.clone(),
                text: text.to_owned(),
            },
        );
        self.persist(ChatEventPayload::ThinkingDone { text: text.to_owned() }).await
    }

    pub async fn emit_tool_call_start(&self, call_id: &str, tool_name: &str, args_so_far: &str) -> Result<()> {
        self.run.mark_tool_call_started(call_id, tool_name);
        let arguments: serde_json::Value =
            serde_json::from_str(args_so_far).unwrap_or(serde_json::Value::Null);
        self.broadcaster.broadcast_to_session(
            &self.run.session_id,
            ServerMessage::ToolCallStart {
                response_id: self.run.response_id.clone(),
                call_id: call_id.to_owned(),
                tool_name: tool_name.to_owned(),
                arguments: arguments.clone(),
            },
        );
        self.persist(ChatEventPayload::ToolCall {
            call_id: call_id.to_owned(),
            tool_name: tool_name.to_owned(),
            arguments,
        })
        .await
    }

    /// Transient only: `tool_input_chunk` never persists. Offset is the
    /// cumulative byte length of everything already emitted for this call.
    pub async fn emit_tool_input_chunk(&self, call_id: &str, chunk: &str) -> Result<()> {
        let offset = self.run.next_input_offset(call_id, chunk.len());
        let event = ChatEvent::new(
            self.run.session_id.clone(),
            ChatEventPayload::ToolInputChunk {
                call_id: call_id.to_owned(),
                tool_name: self.run.tool_name_for(call_id),
                chunk: chunk.to_owned(),
                offset,
            },
        )
        .with_turn(self.run.turn_id.clone())
        .with_response(self.run.response_id.clone());
        self.sink.append(&self.run.session_id, event).await
    }

    pub async fn emit_tool_output_chunk(&self, call_id: &str, tool_name: &str, chunk: &str) -> Result<()> {
        let offset = self.run.next_output_offset(call_id, chunk.len());
        let event = ChatEvent::new(
            self.run.session_id.clone(),
            ChatEventPayload::ToolOutputChunk {
                call_id: call_id.to_owned(),
                tool_name: tool_name.to_owned(),
                chunk: chunk.to_owned(),
                offset,
            },
        )
        .with_turn(self.run.turn_id.clone())
        .with_response(self.run.response_id.clone());
        self.sink.append(&self.run.session_id, event).await
    }

    pub async fn emit_tool_result(&self, call_id: &str, tool_name: &str, ok: bool, result: serde_json::Value) -> Result<()> {
        self.run.mark_tool_call_finished(call_id);
        self.broadcaster.broadcast_to_session(
            &self.run.session_id,
            ServerMessage::ToolResult {
                response_id: self.run.response_id.clone(),
                call_id: call_id.to_owned(),
                tool_name: tool_name.to_owned(),
                ok,
                result: Some(result.clone()),
                error: None,
                truncated: None,
            },
        );
        self.persist(ChatEventPayload::ToolResult {
            call_id: call_id.to_owned(),
            tool_name: tool_name.to_owned(),
            ok,
            result,
            error: None,
        })
        .await
    }

    /// Terminal success emission: the full assistant text, plus the
    /// wire-level `text_done`.
    pub async fn emit_assistant_done(&self, text: &str) -> Result<()> {
        self.broadcaster.broadcast_to_session(
            &self.run.session_id,
            ServerMessage::TextDone {
                response_id: self.run.response_id.clone(),
                text: text.to_owned(),
            },
        );
        self.persist(ChatEventPayload::AssistantDone { text: text.to_owned() }).await
    }

    /// Persists why the turn ended early. The `chat_output_cancelled`
    /// control broadcast is a separate, unconditional step owned by the
    /// cancel handler (it fires even when this event is skipped).
    pub async fn emit_interrupt(&self, reason: &str) -> Result<()> {
        self.persist(ChatEventPayload::Interrupt { reason: reason.to_owned() }).await
    }

    /// Interrupted-tool synthesis: a `tool_result` with a structured error
    /// instead of a value, used when a call was still active at cancel time.
    pub async fn emit_tool_result_error(&self, call_id: &str, tool_name: &str, code: &str, message: &str) -> Result<()> {
        self.run.mark_tool_call_finished(call_id);
        self.broadcaster.broadcast_to_session(
            &self.run.session_id,
            ServerMessage::ToolResult {
                response_id: self.run.response_id.clone(),
                call_id: call_id.to_owned(),
                tool_name: tool_name.to_owned(),
                ok: false,
                result: None,
                error: Some(cro_domain::protocol::ErrorFrame { code: code.to_owned(), message: message.to_owned() }),
                truncated: None,
            },
        );
        self.persist(ChatEventPayload::ToolResult {
            call_id: call_id.to_owned(),
            tool_name: tool_name.to_owned(),
            ok: false,
            result: serde_json::Value::Null,
            error: Some(cro_domain::protocol::ErrorFrame { code: code.to_owned(), message: message.to_owned() }),
        })
        .await
    }

    pub async fn emit_turn_end(&self) -> Result<()> {
        self.persist(ChatEventPayload::TurnEnd).await
    }

    pub async fn emit_error(&self, code: &str, message: &str) -> Result<()> {
        self.broadcaster.broadcast_to_session(
            &self.run.session_id,
            ServerMessage::Error(cro_domain::protocol::ErrorFrame {
                code: code.to_owned(),
                message: message.to_owned(),
            }),
        );
        Ok(())
    }

    async fn persist(&self, payload: ChatEventPayload) -> Result<()> {
        let event = ChatEvent::new(self.run.session_id.clone(), payload)
            .with_turn(self.run.turn_id.clone())
            .with_response(self.run.response_id.clone());
        self.sink.append(&self.run.session_id, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cro_domain::cancel::CancelToken;
    use std::sync::Mutex as StdMutex;

    struct RecordingBroadcaster {
        sent: StdMutex<Vec<ServerMessage>>,
    }
    impl SessionBroadcaster for RecordingBroadcaster {
        fn broadcast_to_session(&self, _session_id: &str, message: ServerMessage) {
            self.sent.lock().unwrap().push(message);
        }
    }

    fn harness() -> (ActiveRun, EventSink, RecordingBroadcaster, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let run = ActiveRun::new("s1", "t1", "r1", CancelToken::new());
        let sink = EventSink::new(dir.path().to_path_buf());
        let broadcaster = RecordingBroadcaster { sent: StdMutex::new(Vec::new()) };
        (run, sink, broadcaster, dir)
    }

    #[tokio::test]
    async fn text_delta_persists_and_broadcasts() {
        let (run, sink, broadcaster, _dir) = harness();
        let handler = StreamHandler::new(&run, &sink, &broadcaster);
        handler.emit_text_delta("hi", "hi").await.unwrap();

        assert_eq!(run.accumulated_text(), "hi");
        let events = sink.get_events("s1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload.label(), "assistant_chunk");
        assert_eq!(broadcaster.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tool_input_chunk_offsets_increase_and_never_persist() {
        let (run, sink, broadcaster, _dir) = harness();
        let handler = StreamHandler::new(&run, &sink, &broadcaster);
        handler.emit_tool_call_start("c1", "shell", "{}").await.unwrap();
        handler.emit_tool_input_chunk("c1", "abc").await.unwrap();
        handler.emit_tool_input_chunk("c1", "de").await.unwrap();

        assert_eq!(run.next_input_offset("c1", 0), 5);
        // Only the tool_call_start event persisted; the two chunks did not.
        let events = sink.get_events("s1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload.label(), "tool_call");
        assert!(run.has_active_tool_calls());
        let _ = broadcaster;
    }

    #[tokio::test]
    async fn tool_result_clears_active_tool_call() {
        let (run, sink, broadcaster, _dir) = harness();
        let handler = StreamHandler::new(&run, &sink, &broadcaster);
        handler.emit_tool_call_start("c1", "shell", "{}").await.unwrap();
        handler
            .emit_tool_result("c1", "shell", true, serde_json::json!({"stdout": "ok"}))
            .await
            .unwrap();

        assert!(!run.has_active_tool_calls());
        let events = sink.get_events("s1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload.label(), "tool_result");
    }

    #[tokio::test]
    async fn errored_tool_result_routes_through_emit_tool_result_error() {
        let (run, sink, broadcaster, _dir) = harness();
        let handler = StreamHandler::new(&run, &sink, &broadcaster);
        handler.emit_tool_call_start("c1", "shell", "{}").await.unwrap();
        handler
            .handle(&StreamEvent::ToolResult {
                call_id: "c1".into(),
                tool_name: "shell".into(),
                ok: false,
                result: serde_json::Value::Null,
                error: Some(("tool_interrupted".into(), "cancelled".into())),
            })
            .await
            .unwrap();

        assert!(!run.has_active_tool_calls());
        let events = sink.get_events("s1").unwrap();
        assert_eq!(events.len(), 2);
        match &events[1].payload {
            ChatEventPayload::ToolResult { ok, error, .. } => {
                assert!(!ok);
                let error = error.as_ref().unwrap();
                assert_eq!(error.code, "tool_interrupted");
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
        let sent = broadcaster.sent.lock().unwrap();
        match &sent[1] {
            ServerMessage::ToolResult { error, result, .. } => {
                assert!(result.is_none());
                assert_eq!(error.as_ref().unwrap().code, "tool_interrupted");
            }
            other => panic!("expected ToolResult, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn thinking_start_is_idempotent() {
        let (run, sink, broadcaster, _dir) = harness();
        let handler = StreamHandler::new(&run, &sink, &broadcaster);
        handler.emit_thinking_start().await.unwrap();
        handler.emit_thinking_start().await.unwrap();

        assert_eq!(broadcaster.sent.lock().unwrap().len(), 1);
    }
}
