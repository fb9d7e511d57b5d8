//! Sweep worker
//!
//! Periodically evicts idle sessions so stores that only expire lazily do not
//! grow without bound between reads.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::context_store::ContextStore;

pub struct SweepWorker {
    store: Arc<dyn ContextStore>,
    period: Duration,
}

/// Running sweeper; stop it with [`SweepHandle::shutdown`].
pub struct SweepHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweepWorker {
    pub fn new(store: Arc<dyn ContextStore>, period: Duration) -> Self {
        Self { store, period }
    }

    /// One pass. Storage errors are logged, never propagated.
    pub async fn sweep_once(&self) -> usize {
        match self.store.sweep_expired().await {
            Ok(removed) => {
                if removed > 0 {
                    info!("Expired {} idle session(s) from {}", removed, self.store.name());
                }
                removed
            }
            Err(e) => {
                warn!("Session sweep on {} failed: {}", self.store.name(), e);
                0
            }
        }
    }

    pub fn spawn(self) -> SweepHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    _ = stopped.changed() => break,
                }
            }
            debug!("Sweep worker for {} stopped", self.store.name());
        });

        SweepHandle { stop, task }
    }
}

impl SweepHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("Sweep worker ended abnormally: {}", e);
        }
    }
}
