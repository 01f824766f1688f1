//! Tracks the process-group ids of live CLI subprocesses so the Session Hub
//! can escalate SIGTERM→SIGKILL against an entire tree on shutdown or
//! cancellation, mirroring `ProcessManager`'s session table but keyed by the
//! process group rather than the process itself.

use std::collections::HashMap;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct ChildHandle {
    pub pgid: i32,
}

#[derive(Default)]
pub struct ChildRegistry {
    children: Mutex<HashMap<Uuid, ChildHandle>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, pgid: i32) {
        self.children.lock().insert(id, ChildHandle { pgid });
    }

    pub fn remove(&self, id: &Uuid) {
        self.children.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.lock().is_empty()
    }

    /// Send `SIGTERM` to every registered process group. Best-effort: a
    /// group that already exited yields `ESRCH`, which is swallowed.
    pub fn terminate_all(&self) {
        for handle in self.children.lock().values() {
            let _ = signal::killpg(Pid::from_raw(handle.pgid), Signal::SIGTERM);
        }
    }

    /// Send `SIGKILL` to every registered process group.
    pub fn kill_all(&self) {
        for handle in self.children.lock().values() {
            let _ = signal::killpg(Pid::from_raw(handle.pgid), Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_remove_tracks_count() {
        let registry = ChildRegistry::new();
        assert!(registry.is_empty());
        let id = Uuid::new_v4();
        registry.register(id, 12345);
        assert_eq!(registry.len(), 1);
        registry.remove(&id);
        assert!(registry.is_empty());
    }
}
