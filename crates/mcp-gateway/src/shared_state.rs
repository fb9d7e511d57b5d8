//! State shared by every HTTP handler.

use std::sync::Arc;

use crate::config::Config;
use crate::context_engine::ChatOrchestrator;

/// Cheap to clone; everything behind it is `Arc`-shared and internally synchronized.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    /// Read-only after startup.
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ChatOrchestrator>, config: Arc<Config>) -> Self {
        Self { orchestrator, config }
    }
}
