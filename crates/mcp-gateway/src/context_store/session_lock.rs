//! Per-session mutual exclusion for read-modify-write turns.
//!
//! Turns on the same session queue behind one async mutex; turns on different
//! sessions never touch each other's lock. Entries are dropped from the map as
//! soon as nobody holds or awaits them.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Clone, Default)]
pub struct SessionLocks {
    locks: Arc<LockMap>,
}

/// Held for the duration of one turn.
pub struct SessionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    session_id: String,
    locks: Arc<LockMap>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        SessionGuard {
            guard: Some(lock.lock_owned().await),
            session_id: session_id.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Sessions with a live holder or waiter.
    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: no holder, no waiter
        self.locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
