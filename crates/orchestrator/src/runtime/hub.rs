//! Owns every session's live state: the attached connections, the chat
//! history, the FIFO message queue, and the one active run (if any).
//!
//! Unlike the teacher's `SessionLockMap`, which only serializes access to
//! a shared resource via a semaphore permit, `submitMessage` here must
//! return immediately with a started/queued status rather than waiting
//! for a permit — so queueing is modeled explicitly with a `VecDeque`
//! per session instead of reusing that primitive.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use cro_domain::config::{AgentConfig, Config};
use cro_domain::error::{OrchestratorError, Result};
use cro_domain::protocol::{ConnectionHandle, ServerMessage};
use cro_domain::tool::Message;
use cro_domain::trace::TraceEvent;
use parking_lot::Mutex;
use uuid::Uuid;

use super::active_run::ActiveRun;
use super::broadcaster::SessionBroadcaster;
use super::cancel::CancelMap;
use super::stream_handler::StreamHandler;
use super::turn::{self, TurnDeps, TurnInput};

/// One message waiting for the session's current run to finish.
struct QueuedMessage {
    agent_id: String,
    text: String,
    response_id: String,
}

/// What `submit_message` tells the caller happened to the message just
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started { response_id: String },
    Queued { response_id: String },
}

/// The Session Hub. Shared behind an `Arc` since every spawned turn task
/// and every attached connection needs a handle back into it.
pub struct SessionHub {
    deps: TurnDeps,
    config: Config,
    cancel_map: CancelMap,
    connections: Mutex<HashMap<String, Vec<Arc<dyn ConnectionHandle>>>>,
    queues: Mutex<HashMap<String, VecDeque<QueuedMessage>>>,
    active_runs: Mutex<HashMap<String, Arc<ActiveRun>>>,
    histories: Mutex<HashMap<String, Vec<Message>>>,
    deleted: Mutex<HashSet<String>>,
}

impl SessionHub {
    pub fn new(deps: TurnDeps, config: Config) -> Arc<Self> {
        Arc::new(Self {
            deps,
            config,
            cancel_map: CancelMap::new(),
            connections: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            active_runs: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
            deleted: Mutex::new(HashSet::new()),
        })
    }

    pub fn delete_session(&self, session_id: &str) {
        self.deleted.lock().insert(session_id.to_owned());
    }

    pub fn is_deleted(&self, session_id: &str) -> bool {
        self.deleted.lock().contains(session_id)
    }

    pub fn attach_connection(&self, session_id: &str, conn: Arc<dyn ConnectionHandle>) {
        self.connections
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .push(conn);
    }

    pub fn detach_connection(&self, session_id: &str, connection_id: &str) {
        let mut conns = self.connections.lock();
        if let Some(list) = conns.get_mut(session_id) {
            list.retain(|c| c.id() != connection_id);
            if list.is_empty() {
                conns.remove(session_id);
            }
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.active_runs.lock().contains_key(session_id)
    }

    /// The persisted event log for a session, in append order.
    pub fn events(&self, session_id: &str) -> Result<Vec<cro_domain::event::ChatEvent>> {
        self.deps.sink.get_events(session_id)
    }

    /// The persisted event log since `after_event_id`, or the full log if
    /// that id is unknown.
    pub fn events_since(&self, session_id: &str, after_event_id: Uuid) -> Result<Vec<cro_domain::event::ChatEvent>> {
        self.deps.sink.get_events_since(session_id, after_event_id)
    }

    /// Accept one inbound message. Rejects empty text and deleted
    /// sessions before anything else is touched. If a run is already
    /// active for the session, the message is appended to its queue and
    /// `Queued` is returned; otherwise a turn starts immediately.
    pub fn submit_message(self: &Arc<Self>, session_id: &str, agent_id: &str, text: &str) -> Result<SubmitOutcome> {
        if text.trim().is_empty() {
            return Err(OrchestratorError::EmptyInput);
        }
        if self.is_deleted(session_id) {
            return Err(OrchestratorError::SessionDeleted);
        }

        self.deps.store.resolve_or_create(session_id, agent_id);
        let response_id = Uuid::new_v4().to_string();

        if self.is_running(session_id) {
            self.queues
                .lock()
                .entry(session_id.to_owned())
                .or_default()
                .push_back(QueuedMessage {
                    agent_id: agent_id.to_owned(),
                    text: text.to_owned(),
                    response_id: response_id.clone(),
                });
            return Ok(SubmitOutcome::Queued { response_id });
        }

        self.start_turn(session_id, agent_id, text, &response_id);
        Ok(SubmitOutcome::Started { response_id })
    }

    /// Registers a fresh active run and spawns the task that drives it to
    /// completion. Assumes the caller has already checked `is_running` is
    /// false for this session.
    fn start_turn(self: &Arc<Self>, session_id: &str, agent_id: &str, text: &str, response_id: &str) {
        let cancel = self.cancel_map.register(session_id);
        let turn_id = Uuid::new_v4().to_string();
        let run = Arc::new(ActiveRun::new(session_id, turn_id.clone(), response_id, cancel));
        self.active_runs.lock().insert(session_id.to_owned(), run.clone());

        let agent_cfg = match self.config.agents.get(agent_id).cloned() {
            Some(cfg) => cfg,
            None => {
                self.broadcast_to_session(
                    session_id,
                    ServerMessage::Error(cro_domain::protocol::ErrorFrame {
                        code: "agent_config_error".into(),
                        message: format!("no agent configured for id {agent_id}"),
                    }),
                );
                self.active_runs.lock().remove(session_id);
                self.cancel_map.remove(session_id);
                return;
            }
        };

        TraceEvent::TurnStarted {
            session_id: session_id.to_owned(),
            turn_id,
            provider: provider_label(&agent_cfg),
        }
        .emit();

        let hub = self.clone();
        let session_id = session_id.to_owned();
        let agent_id = agent_id.to_owned();
        let text = text.to_owned();
        let response_id = response_id.to_owned();

        tokio::spawn(async move {
            let mut messages = hub
                .histories
                .lock()
                .remove(&session_id)
                .unwrap_or_default();

            let input = TurnInput {
                session_id: session_id.clone(),
                agent_id: agent_id.clone(),
                text,
                response_id,
            };

            let result = turn::run_turn(&hub.deps, hub.as_ref(), &agent_cfg, &mut messages, input, run).await;

            hub.histories.lock().insert(session_id.clone(), messages);

            let outcome = match &result {
                Ok(()) => "ok",
                Err(_) => "error",
            };
            TraceEvent::TurnEnded { session_id: session_id.clone(), turn_id: String::new(), outcome: outcome.to_owned() }.emit();

            if let Err(e) = result {
                hub.broadcast_to_session(
                    &session_id,
                    ServerMessage::Error(cro_domain::protocol::ErrorFrame {
                        code: e.code().to_owned(),
                        message: e.to_string(),
                    }),
                );
            }

            hub.finish_turn(&session_id);
        });
    }

    fn finish_turn(self: &Arc<Self>, session_id: &str) {
        self.active_runs.lock().remove(session_id);
        self.cancel_map.remove(session_id);
        self.process_next_queued_message(session_id);
    }

    fn process_next_queued_message(self: &Arc<Self>, session_id: &str) {
        let next = {
            let mut queues = self.queues.lock();
            queues.get_mut(session_id).and_then(|q| q.pop_front())
        };
        if let Some(msg) = next {
            self.start_turn(session_id, &msg.agent_id, &msg.text, &msg.response_id);
        }
    }

    /// The 6-step cancel procedure for an in-flight turn's output. No-op
    /// if nothing is currently running for the session.
    pub async fn handle_output_cancel(self: &Arc<Self>, session_id: &str, audio_end_ms: Option<f64>) -> Result<()> {
        let run = match self.active_runs.lock().get(session_id).cloned() {
            Some(run) => run,
            None => return Ok(()),
        };

        if let Some(ms) = audio_end_ms {
            if ms.is_finite() && ms >= 0.0 {
                run.set_audio_end_ms(ms);
            }
        }

        run.set_output_cancelled();
        run.cancel.cancel();
        TraceEvent::CancelIssued { session_id: session_id.to_owned(), cascaded_to: 0 }.emit();

        let accumulated = run.accumulated_text();
        let active_tool_calls = run.active_tool_call_ids();
        let had_activity = !accumulated.is_empty() || !active_tool_calls.is_empty() || !run.thinking_text().is_empty();

        let handler = StreamHandler::new(&run, &self.deps.sink, self.as_ref());

        if !accumulated.is_empty() {
            handler.emit_assistant_done(&accumulated).await?;
        }

        for call_id in &active_tool_calls {
            let tool_name = run.tool_name_for(call_id);
            handler
                .emit_tool_result_error(call_id, &tool_name, "tool_interrupted", "Tool call was interrupted by the user")
                .await?;
        }
        run.clear_active_tool_calls();

        if had_activity {
            handler.emit_interrupt("user_cancel").await?;
        }

        self.broadcast_to_session(
            session_id,
            ServerMessage::ChatOutputCancelled {
                session_id: session_id.to_owned(),
                response_id: run.response_id.clone(),
            },
        );

        Ok(())
    }

    /// Fan out `message` to every connection attached to `session_id`
    /// except `exclude_connection_id` (the one that just originated it).
    pub fn broadcast_to_session_excluding(&self, session_id: &str, message: ServerMessage, exclude_connection_id: &str) {
        if let Some(conns) = self.connections.lock().get(session_id) {
            for conn in conns {
                if conn.id() != exclude_connection_id {
                    conn.send(&message);
                }
            }
        }
    }
}

impl SessionBroadcaster for SessionHub {
    fn broadcast_to_session(&self, session_id: &str, message: ServerMessage) {
        if let Some(conns) = self.connections.lock().get(session_id) {
            for conn in conns {
                conn.send(&message);
            }
        }
    }
}

fn provider_label(cfg: &AgentConfig) -> String {
    match cfg {
        AgentConfig::External { .. } => "external".to_owned(),
        AgentConfig::Chat(c) => match c.provider {
            cro_domain::config::ProviderKind::InProcess => "in_process".to_owned(),
            cro_domain::config::ProviderKind::CliA => "cli_a".to_owned(),
            cro_domain::config::ProviderKind::CliB => "cli_b".to_owned(),
            cro_domain::config::ProviderKind::CliC => "cli_c".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cro_domain::config::{ChatAgentConfig, ProviderKind, ToolPolicy};
    use cro_providers::cli::ChildRegistry;
    use cro_providers::ProviderRegistry;
    use cro_sessions::{EventSink, SessionStore};

    struct RecordingConnection {
        id: String,
        received: Mutex<Vec<ServerMessage>>,
    }
    impl ConnectionHandle for RecordingConnection {
        fn id(&self) -> &str {
            &self.id
        }
        fn send(&self, message: &ServerMessage) -> bool {
            self.received.lock().push(message.clone());
            true
        }
    }

    fn chat_cfg() -> ChatAgentConfig {
        ChatAgentConfig {
            provider: ProviderKind::InProcess,
            model: None,
            base_url: None,
            api_key: None,
            extra_headers: Default::default(),
            timeout_secs: 60,
            reasoning_level: None,
            working_dir: None,
            extra_args: vec![],
            wrapper: None,
            max_tool_iterations: 10,
            tool_policy: ToolPolicy::default(),
        }
    }

    fn test_hub() -> (Arc<SessionHub>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.agents.insert("main".into(), AgentConfig::Chat(chat_cfg()));

        let deps = TurnDeps {
            sink: Arc::new(EventSink::new(dir.path().to_path_buf())),
            store: Arc::new(SessionStore::new(dir.path()).unwrap()),
            providers: Arc::new(ProviderRegistry::from_config(&config).unwrap()),
            cli_registry: Arc::new(ChildRegistry::new()),
            rate_limiter: Arc::new(super::super::tools::RateLimiter::default()),
            http_client: reqwest::Client::new(),
        };
        (SessionHub::new(deps, config), dir)
    }

    #[test]
    fn empty_text_is_rejected_before_anything_starts() {
        let (hub, _dir) = test_hub();
        let err = hub.submit_message("s1", "main", "   ").unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyInput));
        assert!(!hub.is_running("s1"));
    }

    #[test]
    fn deleted_session_is_rejected() {
        let (hub, _dir) = test_hub();
        hub.delete_session("s1");
        let err = hub.submit_message("s1", "main", "hi").unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionDeleted));
    }

    #[test]
    fn second_submit_while_running_is_queued() {
        let (hub, _dir) = test_hub();
        let first = hub.submit_message("s1", "main", "hi").unwrap();
        assert!(matches!(first, SubmitOutcome::Started { .. }));
        assert!(hub.is_running("s1"));

        let second = hub.submit_message("s1", "main", "again").unwrap();
        assert!(matches!(second, SubmitOutcome::Queued { .. }));
        assert_eq!(hub.queues.lock().get("s1").map(|q| q.len()), Some(1));
    }

    #[tokio::test]
    async fn cancel_with_no_activity_emits_no_terminal_event() {
        let (hub, _dir) = test_hub();
        hub.submit_message("s1", "main", "hi").unwrap();
        // Nothing has streamed yet; cancelling should still be safe and
        // broadcast exactly the control message.
        hub.handle_output_cancel("s1", None).await.unwrap();
        let events = hub.deps.sink.get_events("s1").unwrap();
        assert!(events.iter().all(|e| e.payload.label() != "interrupt"));
    }

    #[test]
    fn attach_and_detach_connection() {
        let (hub, _dir) = test_hub();
        let conn = Arc::new(RecordingConnection { id: "c1".into(), received: Mutex::new(Vec::new()) });
        hub.attach_connection("s1", conn.clone());
        hub.broadcast_to_session("s1", ServerMessage::TextDone { response_id: "r1".into(), text: "hi".into() });
        assert_eq!(conn.received.lock().len(), 1);

        hub.detach_connection("s1", "c1");
        hub.broadcast_to_session("s1", ServerMessage::TextDone { response_id: "r1".into(), text: "again".into() });
        assert_eq!(conn.received.lock().len(), 1);
    }
}
