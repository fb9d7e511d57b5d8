//! Session-aware chat gateway: keeps per-session transcripts in a pluggable
//! context store and routes each turn to a lazily loaded model backend.

pub mod config;
pub mod context_engine;
pub mod context_store;
pub mod error;
pub mod memory;
pub mod model_runtime;
pub mod telemetry;
pub mod worker_threads;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod metrics;
#[cfg(feature = "cli")]
pub mod server;
#[cfg(feature = "cli")]
pub mod shared_state;

// Public API exports
pub use config::Config;
pub use context_engine::{ChatOrchestrator, ChatRequest, ChatResponse};
pub use context_store::ContextStore;
pub use error::{GatewayError, GatewayResult};
pub use memory::{Message, Role, Transcript};
pub use model_runtime::{BackendRegistry, ModelBackend, RoutingPolicy};

#[cfg(feature = "cli")]
pub use server::run_server;
