use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::warn;

use super::process;

/// Live worker process ids, shared by every session of a run.
///
/// Constructed once at startup and handed to each `WorkerSession`. It is a
/// last-resort net for an abrupt exit of the conductor itself, not a way to
/// coordinate sessions.
#[derive(Debug, Clone, Default)]
pub struct PidRegistry {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl PidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        // A poisoned set is still a valid set of pids
        self.pids.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, pid: u32) {
        self.lock().insert(pid);
    }

    pub fn unregister(&self, pid: u32) {
        self.lock().remove(&pid);
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.lock().contains(&pid)
    }

    pub fn snapshot(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Force-kill every registered tree. Returns how many were registered.
    pub fn reap_all(&self) -> usize {
        let pids: Vec<u32> = self.lock().drain().collect();
        for &pid in &pids {
            warn!(pid, "reaping straggler worker process tree");
            process::kill_tree_now(pid);
        }
        pids.len()
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        self.lock().clear();
    }
}
