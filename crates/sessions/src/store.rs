//! Session state.
//!
//! Persists session metadata in `sessions.json` under the configured data
//! directory. Each opaque session id maps to a `SessionEntry` tracking
//! which agent it is bound to and running token counters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use cro_domain::error::{OrchestratorError, Result};

/// A single session tracked across turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The provider-native session/thread id, if the provider surfaced one
    /// (CLI B's thread id, CLI C's session header, etc).
    #[serde(default)]
    pub provider_session_id: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Session metadata store backed by a JSON file.
pub struct SessionStore {
    sessions_path: PathBuf,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    /// Load or create the session store at `data_dir/sessions/sessions.json`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("sessions");
        std::fs::create_dir_all(&dir)?;

        let sessions_path = dir.join("sessions.json");
        let sessions = if sessions_path.exists() {
            let raw = std::fs::read_to_string(&sessions_path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            sessions_path,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Resolve or create a session bound to `agent_id`. Returns `(entry,
    /// is_new)`.
    pub fn resolve_or_create(&self, session_id: &str, agent_id: &str) -> (SessionEntry, bool) {
        {
            let sessions = self.sessions.read();
            if let Some(entry) = sessions.get(session_id) {
                return (entry.clone(), false);
            }
        }

        let now = Utc::now();
        let entry = SessionEntry {
            session_id: session_id.to_owned(),
            agent_id: agent_id.to_owned(),
            created_at: now,
            updated_at: now,
            provider_session_id: None,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
        };

        let mut sessions = self.sessions.write();
        sessions.insert(session_id.to_owned(), entry.clone());
        (entry, true)
    }

    pub fn record_usage(&self, session_id: &str, input_tokens: u64, output_tokens: u64) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
            entry.total_tokens += input_tokens + output_tokens;
            entry.updated_at = Utc::now();
        }
    }

    pub fn set_provider_session_id(&self, session_id: &str, provider_session_id: String) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.provider_session_id = Some(provider_session_id);
        }
    }

    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.updated_at = Utc::now();
        }
    }

    pub fn list(&self) -> Vec<SessionEntry> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn flush(&self) -> Result<()> {
        let sessions = self.sessions.read();
        let json = serde_json::to_string_pretty(&*sessions)
            .map_err(|e| OrchestratorError::Other(format!("serializing sessions: {e}")))?;
        std::fs::write(&self.sessions_path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let (first, is_new) = store.resolve_or_create("s1", "main");
        assert!(is_new);
        let (second, is_new2) = store.resolve_or_create("s1", "main");
        assert!(!is_new2);
        assert_eq!(first.session_id, second.session_id);
    }

    #[test]
    fn record_usage_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.resolve_or_create("s1", "main");
        store.record_usage("s1", 10, 20);
        store.record_usage("s1", 5, 5);
        let entry = store.get("s1").unwrap();
        assert_eq!(entry.input_tokens, 15);
        assert_eq!(entry.output_tokens, 25);
        assert_eq!(entry.total_tokens, 40);
    }

    #[test]
    fn flush_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        store.resolve_or_create("s1", "main");
        store.flush().unwrap();

        let reopened = SessionStore::new(dir.path()).unwrap();
        assert!(reopened.get("s1").is_some());
    }
}
