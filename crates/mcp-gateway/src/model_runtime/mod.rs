//! Model runtime: backend capability, concrete backend families, registry
//! and routing.
//!
//! Architecture:
//! - Every backend implements [`ModelBackend`]; the registry only ever holds
//!   `Arc<dyn ModelBackend>`
//! - Local families (DeepSeek, Llama) reach a llama.cpp-compatible server over HTTP
//! - Backends load lazily on first use, at most once per attempt
//! - Routing maps task names or backend ids onto registered backends
pub mod runtime_trait;
pub mod prompt_format;
pub mod local_backend;
pub mod registry;
pub mod routing;
pub use runtime_trait::{BackendDescriptor, BackendInfo, GenerationParameters, LifecycleState, ModelBackend};
pub use prompt_format::PromptTemplate;
pub use local_backend::{LocalBackendConfig, LocalModelBackend};
pub use registry::BackendRegistry;
pub use routing::RoutingPolicy;
