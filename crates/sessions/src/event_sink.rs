//! Validates, persists, and broadcasts `ChatEvent` records.
//!
//! One append-only JSONL file per session under
//! `<data_dir>/sessions/<session_id>/events.jsonl`; writes within a session
//! are serialized through a per-session async mutex so the log stays in
//! event order even when multiple producers append concurrently (the
//! reader loop and a tool's `onUpdate` callback, say). A session whose
//! transcript is owned elsewhere (a CLI with its own session store) can be
//! marked delegated: `append`/`append_batch` still validate but skip both
//! the write and the broadcast.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use cro_domain::error::{OrchestratorError, Result};
use cro_domain::event::ChatEvent;
use cro_domain::trace::TraceEvent;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use uuid::Uuid;

const BROADCAST_CAPACITY: usize = 1024;

pub struct EventSink {
    data_dir: PathBuf,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    broadcasters: RwLock<HashMap<String, broadcast::Sender<ChatEvent>>>,
    delegated: RwLock<HashSet<String>>,
}

impl EventSink {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            write_locks: Mutex::new(HashMap::new()),
            broadcasters: RwLock::new(HashMap::new()),
            delegated: RwLock::new(HashSet::new()),
        }
    }

    /// Mark a session as delegating transcript ownership to an external
    /// process. `append`/`append_batch` stop persisting and broadcasting
    /// for it; `subscribe` remains valid but yields nothing new.
    pub fn mark_delegated(&self, session_id: &str) {
        self.delegated.write().insert(session_id.to_string());
    }

    pub fn should_persist(&self, session_id: &str) -> bool {
        !self.delegated.read().contains(session_id)
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<ChatEvent> {
        self.broadcasters
            .write()
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .subscribe()
    }

    pub async fn append(&self, session_id: &str, event: ChatEvent) -> Result<()> {
        self.append_batch(session_id, vec![event]).await
    }

    pub async fn append_batch(&self, session_id: &str, events: Vec<ChatEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        for event in &events {
            if event.session_id != session_id {
                return Err(OrchestratorError::SessionMismatch {
                    expected: session_id.to_string(),
                    actual: event.session_id.clone(),
                });
            }
        }

        if self.should_persist(session_id) {
            if let Err(e) = self.persist(session_id, &events).await {
                TraceEvent::EventAppendFailed {
                    session_id: session_id.to_string(),
                    reason: e.to_string(),
                }
                .emit();
            }
            for event in &events {
                self.broadcast(session_id, event);
            }
        }

        Ok(())
    }

    async fn persist(&self, session_id: &str, events: &[ChatEvent]) -> Result<()> {
        let mut buf = String::new();
        for event in events {
            if !event.persisted() {
                continue;
            }
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }
        if buf.is_empty() {
            return Ok(());
        }

        let lock = self.write_lock_for(session_id);
        let _guard = lock.lock().await;

        let path = self.log_path(session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        Ok(())
    }

    fn write_lock_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn broadcast(&self, session_id: &str, event: &ChatEvent) {
        if let Some(sender) = self.broadcasters.read().get(session_id) {
            // No subscribers, or a slow one that lagged: both are fine,
            // clients reconcile via getEventsSince on reconnect.
            let _ = sender.send(event.clone());
        }
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.data_dir
            .join("sessions")
            .join(session_id)
            .join("events.jsonl")
    }

    pub fn get_events(&self, session_id: &str) -> Result<Vec<ChatEvent>> {
        let path = self.log_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "skipping malformed event line");
                }
            }
        }
        Ok(events)
    }

    /// Events strictly after `after_event_id`. An id not found in the log
    /// (the caller's bookmark predates what we have, or never existed)
    /// yields the full log — the safe default for resume.
    pub fn get_events_since(&self, session_id: &str, after_event_id: Uuid) -> Result<Vec<ChatEvent>> {
        let events = self.get_events(session_id)?;
        match events.iter().rposition(|e| e.id == after_event_id) {
            Some(pos) => Ok(events[pos + 1..].to_vec()),
            None => Ok(events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cro_domain::event::ChatEventPayload;

    fn sink() -> (EventSink, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (EventSink::new(dir.path().to_path_buf()), dir)
    }

    #[tokio::test]
    async fn append_rejects_session_mismatch() {
        let (sink, _dir) = sink();
        let event = ChatEvent::new("other", ChatEventPayload::TurnEnd);
        let err = sink.append("s1", event).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::SessionMismatch { .. }));
    }

    #[tokio::test]
    async fn append_persists_and_is_readable() {
        let (sink, _dir) = sink();
        let event = ChatEvent::new("s1", ChatEventPayload::TurnEnd);
        sink.append("s1", event.clone()).await.unwrap();

        let events = sink.get_events("s1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
    }

    #[tokio::test]
    async fn transient_events_are_broadcast_but_not_persisted() {
        let (sink, _dir) = sink();
        let mut rx = sink.subscribe("s1");
        let event = ChatEvent::new(
            "s1",
            ChatEventPayload::ToolOutputChunk {
                call_id: "c1".into(),
                tool_name: "shell".into(),
                chunk: "hi".into(),
                offset: 0,
            },
        );
        sink.append("s1", event).await.unwrap();

        assert!(sink.get_events("s1").unwrap().is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn delegated_sessions_skip_persist_and_broadcast() {
        let (sink, _dir) = sink();
        sink.mark_delegated("s1");
        let mut rx = sink.subscribe("s1");
        let event = ChatEvent::new("s1", ChatEventPayload::TurnEnd);
        sink.append("s1", event).await.unwrap();

        assert!(sink.get_events("s1").unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn get_events_since_unknown_id_returns_full_log() {
        let (sink, _dir) = sink();
        sink.append("s1", ChatEvent::new("s1", ChatEventPayload::TurnEnd))
            .await
            .unwrap();
        let events = sink.get_events_since("s1", Uuid::new_v4()).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn get_events_since_known_id_returns_suffix() {
        let (sink, _dir) = sink();
        let first = ChatEvent::new("s1", ChatEventPayload::TurnStart {
            trigger: cro_domain::event::TurnTrigger::User,
        });
        let first_id = first.id;
        sink.append("s1", first).await.unwrap();
        sink.append("s1", ChatEvent::new("s1", ChatEventPayload::TurnEnd))
            .await
            .unwrap();

        let events = sink.get_events_since("s1", first_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload.label(), "turn_end");
    }
}
