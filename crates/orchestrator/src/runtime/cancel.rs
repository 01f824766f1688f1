//! Per-session cancellation with group fan-out.
//!
//! Each running turn is registered under its session id. Calling
//! [`CancelMap::cancel`] flips the token a reader observes cooperatively
//! (HTTP streaming) or preemptively (CLI subprocess signal escalation via
//! `cro_providers::cli`, which holds the same [`CancelToken`] clone).
//!
//! Groups cascade: an agent-to-agent sub-turn registers its session key as
//! a child of the parent's, so cancelling the parent also cancels every
//! child still running.

use std::collections::{HashMap, HashSet};

use cro_domain::cancel::CancelToken;
use parking_lot::Mutex;

pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(session_id.to_owned(), token.clone());
        token
    }

    /// Cancel the running turn for a session, cascading to any children
    /// registered in its group. Returns true if a token was found.
    pub fn cancel(&self, session_id: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(session_id) {
            token.cancel();
            true
        } else {
            false
        };

        if let Some(children) = self.groups.lock().get(session_id) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(child_token) = tokens.get(child) {
                    child_token.cancel();
                }
            }
        }

        found
    }

    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
        self.groups.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }

    pub fn add_to_group(&self, parent_id: &str, child_id: &str) {
        self.groups
            .lock()
            .entry(parent_id.to_owned())
            .or_default()
            .insert(child_id.to_owned());
    }

    pub fn remove_from_group(&self, parent_id: &str, child_id: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent_id) {
            children.remove(child_id);
            if children.is_empty() {
                groups.remove(parent_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_cancel() {
        let map = CancelMap::new();
        let token = map.register("s1");
        assert!(map.is_running("s1"));
        assert!(map.cancel("s1"));
        assert!(token.is_cancelled());
        map.remove("s1");
        assert!(!map.is_running("s1"));
    }

    #[test]
    fn cancel_cascades_to_children() {
        let map = CancelMap::new();
        let parent = map.register("parent");
        let child = map.register("child");
        map.add_to_group("parent", "child");

        map.cancel("parent");
        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn remove_from_group_prevents_cascade() {
        let map = CancelMap::new();
        map.register("parent");
        let child = map.register("child");
        map.add_to_group("parent", "child");
        map.remove_from_group("parent", "child");

        map.cancel("parent");
        assert!(!child.is_cancelled());
    }

    #[test]
    fn cancel_unknown_session_returns_false() {
        let map = CancelMap::new();
        assert!(!map.cancel("ghost"));
    }
}
