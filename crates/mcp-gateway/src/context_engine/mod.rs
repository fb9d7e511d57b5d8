//! Context engine module - orchestrates chat turns over stored session context

pub mod orchestrator;

pub use orchestrator::{ChatOrchestrator, ChatRequest, ChatResponse, OrchestratorConfig};
