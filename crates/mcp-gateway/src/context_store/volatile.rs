use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use super::ContextStore;
use crate::error::GatewayResult;
use crate::memory::{Message, Transcript};

#[derive(Debug, Clone)]
struct Entry {
    transcript: Transcript,
    last_access: Instant,
}

/// In-process store. Each key lives in a sharded, locked map slot, so every
/// operation on one session is linearizable.
pub struct VolatileContextStore {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl VolatileContextStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_access.elapsed() <= self.ttl);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl ContextStore for VolatileContextStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, session_id: &str) -> GatewayResult<Option<Transcript>> {
        self.remove_expired();

        Ok(self.entries.get_mut(session_id).and_then(|mut entry| {
            // Expired between the sweep and this lookup
            if entry.last_access.elapsed() > self.ttl {
                return None;
            }
            entry.last_access = Instant::now();
            Some(entry.transcript.clone())
        }))
    }

    async fn put(&self, session_id: &str, transcript: &[Message]) -> GatewayResult<()> {
        self.entries.insert(
            session_id.to_string(),
            Entry {
                transcript: transcript.to_vec(),
                last_access: Instant::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> GatewayResult<bool> {
        Ok(self.entries.remove(session_id).is_some())
    }

    async fn sweep_expired(&self) -> GatewayResult<usize> {
        let removed = self.remove_expired();
        if removed > 0 {
            debug!("Swept {} expired in-memory session(s)", removed);
        }
        Ok(removed)
    }
}
