use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_ROUTE};
use crate::context_store::{ContextStore, SessionLocks};
use crate::error::{GatewayError, GatewayResult};
use crate::memory::{Message, Transcript};
use crate::model_runtime::{BackendInfo, BackendRegistry, GenerationParameters, RoutingPolicy};

/// One chat turn as submitted by a caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Task name or backend id; `default` when absent.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default = "default_save_context")]
    pub save_context: bool,
}

fn default_save_context() -> bool {
    true
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            save_context: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub response: String,
    /// Backend id that actually served the turn.
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub generation_defaults: GenerationParameters,
    pub generate_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            generation_defaults: GenerationParameters::default(),
            generate_timeout: Duration::from_secs(300),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            generation_defaults: config.generation_defaults(),
            generate_timeout: config.generate_timeout(),
        }
    }
}

/// Drives a chat turn end to end: session transcript, routing, backend
/// readiness, generation and persistence.
pub struct ChatOrchestrator {
    store: Arc<dyn ContextStore>,
    locks: SessionLocks,
    registry: Arc<BackendRegistry>,
    routing: Arc<RoutingPolicy>,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn ContextStore>,
        registry: Arc<BackendRegistry>,
        routing: Arc<RoutingPolicy>,
        config: OrchestratorConfig,
    ) -> Self {
        info!(
            "Chat orchestrator initialized (store: {}, generate timeout: {}s)",
            store.name(),
            config.generate_timeout.as_secs()
        );
        Self {
            store,
            locks: SessionLocks::new(),
            registry,
            routing,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn routing(&self) -> &Arc<RoutingPolicy> {
        &self.routing
    }

    pub async fn handle_turn(&self, request: ChatRequest) -> GatewayResult<ChatResponse> {
        let ChatRequest {
            session_id,
            messages,
            model,
            parameters,
            save_context,
        } = request;

        // Reject bad options before touching the session or any backend
        let parameters = self
            .config
            .generation_defaults
            .layered(&parameters.unwrap_or_default())?;

        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let routing_key = model
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ROUTE.to_string());

        let _session = self.locks.acquire(&session_id).await;

        let mut transcript = self.store.get(&session_id).await?.unwrap_or_default();
        if !messages.is_empty() {
            debug!("Session {}: appending {} turn(s)", session_id, messages.len());
            transcript.extend(messages);
            self.store.put(&session_id, &transcript).await?;
        }

        let (backend_id, text) = self
            .generate(&routing_key, &transcript, &parameters)
            .await
            .map_err(|e| {
                warn!("Session {}: turn on '{}' failed: {}", session_id, routing_key, e);
                match e {
                    GatewayError::GenerationFailed { .. } => e,
                    other => GatewayError::generation(other.to_string()),
                }
            })?;

        if save_context {
            transcript.push(Message::assistant(text.clone()));
            self.store.put(&session_id, &transcript).await?;
        }

        info!(
            "Session {}: '{}' answered via '{}' ({} turn(s) in context)",
            session_id,
            routing_key,
            backend_id,
            transcript.len()
        );
        Ok(ChatResponse {
            session_id,
            response: text,
            model: backend_id,
        })
    }

    /// Resolve, make ready, generate under the deadline.
    async fn generate(
        &self,
        routing_key: &str,
        transcript: &Transcript,
        parameters: &GenerationParameters,
    ) -> GatewayResult<(String, String)> {
        let backend_id = self.routing.resolve(routing_key)?;
        let backend = self.registry.ensure_ready(&backend_id).await?;

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.generate_timeout, backend.generate(transcript, parameters)).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(text)) => Ok((backend_id.clone(), text)),
            Ok(Err(e)) => Err(GatewayError::generation(format!("{:#}", e))),
            Err(_) => Err(GatewayError::generation("timeout")),
        };

        #[cfg(feature = "cli")]
        {
            crate::metrics::observe_generation(&backend_id, elapsed.as_secs_f64());
            crate::metrics::inc_chat(&backend_id, if result.is_ok() { "ok" } else { "error" });
        }
        debug!("Backend '{}' generation took {:?}", backend_id, elapsed);

        result
    }

    /// Removes a session and its transcript.
    pub async fn delete_session(&self, session_id: &str) -> GatewayResult<()> {
        let _session = self.locks.acquire(session_id).await;
        if self.store.delete(session_id).await? {
            info!("Session {} deleted", session_id);
            Ok(())
        } else {
            Err(GatewayError::SessionNotFound(session_id.to_string()))
        }
    }

    pub fn list_backends(&self) -> Vec<BackendInfo> {
        self.registry.list()
    }

    /// Loads a backend ahead of its first turn.
    pub async fn load_backend(&self, backend_id: &str) -> GatewayResult<BackendInfo> {
        self.registry.ensure_ready(backend_id).await?;
        self.registry
            .list()
            .into_iter()
            .find(|info| info.descriptor.id == backend_id)
            .ok_or_else(|| GatewayError::BackendLoadFailed {
                id: backend_id.to_string(),
                cause: "backend was unregistered during load".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_store::VolatileContextStore;
    use crate::model_runtime::registry::tests::StubBackend;
    use crate::model_runtime::LifecycleState;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    struct Harness {
        orchestrator: Arc<ChatOrchestrator>,
        store: Arc<VolatileContextStore>,
        backends: HashMap<String, Arc<StubBackend>>,
    }

    fn harness(stubs: Vec<StubBackend>, routes: &[(&str, &str)], timeout: Duration) -> Harness {
        let registry = Arc::new(BackendRegistry::new());
        let mut backends = HashMap::new();
        for stub in stubs {
            let stub = Arc::new(stub);
            registry.register(&stub.id, stub.clone());
            backends.insert(stub.id.clone(), stub);
        }
        let table = routes
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let routing = Arc::new(RoutingPolicy::new(table, Arc::clone(&registry)));
        let store = Arc::new(VolatileContextStore::new(Duration::from_secs(60)));
        let config = OrchestratorConfig {
            generate_timeout: timeout,
            ..Default::default()
        };
        Harness {
            orchestrator: Arc::new(ChatOrchestrator::new(store.clone(), registry, routing, config)),
            store,
            backends,
        }
    }

    fn two_backends() -> Harness {
        harness(
            vec![StubBackend::new("A", "from A"), StubBackend::new("B", "from B")],
            &[("default", "A"), ("translation", "B")],
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn new_session_round_trip() {
        let h = two_backends();
        let reply = h
            .orchestrator
            .handle_turn(ChatRequest::new(vec![Message::user("hello")]))
            .await
            .unwrap();

        assert!(Uuid::parse_str(&reply.session_id).is_ok());
        assert_eq!(reply.model, "A");
        assert_eq!(reply.response, "from A");

        let stored = h.store.get(&reply.session_id).await.unwrap().unwrap();
        assert_eq!(stored, vec![Message::user("hello"), Message::assistant("from A")]);
    }

    #[tokio::test]
    async fn follow_up_without_turns_grows_by_one() {
        let h = two_backends();
        let first = h
            .orchestrator
            .handle_turn(ChatRequest::new(vec![Message::user("hello")]))
            .await
            .unwrap();

        let follow_up = ChatRequest {
            session_id: Some(first.session_id.clone()),
            ..ChatRequest::new(Vec::new())
        };
        h.orchestrator.handle_turn(follow_up).await.unwrap();

        let stored = h.store.get(&first.session_id).await.unwrap().unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn unknown_session_with_no_turns_starts_empty() {
        let h = two_backends();
        let request = ChatRequest {
            session_id: Some("fresh".into()),
            ..ChatRequest::new(Vec::new())
        };
        let reply = h.orchestrator.handle_turn(request).await.unwrap();

        assert_eq!(reply.session_id, "fresh");
        let (seen, _) = h.backends["A"].last_call.lock().unwrap().clone().unwrap();
        assert!(seen.is_empty());
        assert_eq!(h.store.get("fresh").await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn save_context_false_keeps_only_caller_turns() {
        let h = two_backends();
        let request = ChatRequest {
            session_id: Some("s".into()),
            save_context: false,
            ..ChatRequest::new(vec![Message::user("hi")])
        };
        h.orchestrator.handle_turn(request).await.unwrap();

        assert_eq!(h.store.get("s").await.unwrap(), Some(vec![Message::user("hi")]));
    }

    #[tokio::test]
    async fn model_names_a_task_or_backend() {
        let h = two_backends();
        for (model, expected) in [("translation", "B"), ("B", "B"), ("A", "A"), ("poetry", "A")] {
            let request = ChatRequest {
                model: Some(model.into()),
                ..ChatRequest::new(vec![Message::user("x")])
            };
            assert_eq!(h.orchestrator.handle_turn(request).await.unwrap().model, expected);
        }
    }

    #[tokio::test]
    async fn caller_parameters_override_defaults_key_by_key() {
        let h = two_backends();
        let request = ChatRequest {
            parameters: json!({"temperature": 0.1, "seed": 7}).as_object().cloned(),
            ..ChatRequest::new(vec![Message::user("x")])
        };
        h.orchestrator.handle_turn(request).await.unwrap();

        let (_, params) = h.backends["A"].last_call.lock().unwrap().clone().unwrap();
        assert_eq!(params.temperature, 0.1);
        assert_eq!(params.top_p, 0.95);
        assert_eq!(params.max_new_tokens, 2048);
        assert_eq!(params.extra.get("seed"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn mistyped_parameters_are_rejected_before_any_work() {
        let h = two_backends();
        let request = ChatRequest {
            session_id: Some("s".into()),
            parameters: json!({"temperature": "hot"}).as_object().cloned(),
            ..ChatRequest::new(vec![Message::user("x")])
        };
        let err = h.orchestrator.handle_turn(request).await.unwrap_err();

        assert!(matches!(err, GatewayError::InvalidParameters(_)));
        assert_eq!(h.store.get("s").await.unwrap(), None);
        assert_eq!(h.backends["A"].load_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generation_error_leaves_caller_turns_and_backend_ready() {
        let h = two_backends();
        h.backends["A"].fail_generate.store(true, Ordering::SeqCst);

        let request = ChatRequest {
            session_id: Some("s".into()),
            ..ChatRequest::new(vec![Message::user("hello")])
        };
        let err = h.orchestrator.handle_turn(request).await.unwrap_err();

        assert_eq!(err.kind(), "generation_failed");
        assert!(err.to_string().contains("CUDA out of memory"));
        assert_eq!(h.store.get("s").await.unwrap(), Some(vec![Message::user("hello")]));
        assert_eq!(h.orchestrator.registry().state("A"), Some(LifecycleState::Ready));
    }

    #[tokio::test]
    async fn load_failure_surfaces_as_generation_failed() {
        let h = two_backends();
        h.backends["A"].fail_load.store(true, Ordering::SeqCst);

        let request = ChatRequest {
            session_id: Some("s".into()),
            ..ChatRequest::new(vec![Message::user("hello")])
        };
        let err = h.orchestrator.handle_turn(request).await.unwrap_err();

        assert!(matches!(err, GatewayError::GenerationFailed { .. }));
        assert!(err.to_string().contains("weights missing"));
        assert_eq!(h.store.get("s").await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slow_generation_times_out() {
        let slow = StubBackend {
            generate_delay: Duration::from_millis(500),
            ..StubBackend::new("A", "late")
        };
        let h = harness(vec![slow], &[("default", "A")], Duration::from_millis(50));

        let err = h
            .orchestrator
            .handle_turn(ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        match err {
            GatewayError::GenerationFailed { reason } => assert_eq!(reason, "timeout"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_lose_nothing() {
        let h = two_backends();
        let mut handles = Vec::new();
        for i in 0..10 {
            let orchestrator = Arc::clone(&h.orchestrator);
            handles.push(tokio::spawn(async move {
                let request = ChatRequest {
                    session_id: Some("shared".into()),
                    ..ChatRequest::new(vec![Message::user(format!("turn {}", i))])
                };
                orchestrator.handle_turn(request).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = h.store.get("shared").await.unwrap().unwrap();
        assert_eq!(stored.len(), 20);
        for i in 0..10 {
            assert!(stored.contains(&Message::user(format!("turn {}", i))));
        }
    }

    #[tokio::test]
    async fn other_sessions_are_not_blocked_by_a_slow_turn() {
        let slow = StubBackend {
            generate_delay: Duration::from_millis(400),
            ..StubBackend::new("slow", "eventually")
        };
        let h = harness(
            vec![slow, StubBackend::new("fast", "now")],
            &[("default", "fast")],
            Duration::from_secs(5),
        );

        let orchestrator = Arc::clone(&h.orchestrator);
        let long_turn = tokio::spawn(async move {
            let request = ChatRequest {
                session_id: Some("s1".into()),
                model: Some("slow".into()),
                ..ChatRequest::new(vec![Message::user("think hard")])
            };
            orchestrator.handle_turn(request).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let request = ChatRequest {
            session_id: Some("s2".into()),
            ..ChatRequest::new(vec![Message::user("quick")])
        };
        let quick = tokio::time::timeout(Duration::from_millis(200), h.orchestrator.handle_turn(request)).await;
        assert_eq!(quick.unwrap().unwrap().response, "now");

        assert_eq!(long_turn.await.unwrap().unwrap().response, "eventually");
    }

    #[tokio::test]
    async fn delete_session_reports_absence() {
        let h = two_backends();
        h.store.put("s", &[Message::user("x")]).await.unwrap();

        assert!(h.orchestrator.delete_session("s").await.is_ok());
        assert!(matches!(
            h.orchestrator.delete_session("s").await,
            Err(GatewayError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn load_backend_reports_ready_state() {
        let h = two_backends();
        let info = h.orchestrator.load_backend("B").await.unwrap();
        assert!(info.state.is_ready());
        assert_eq!(h.backends["B"].load_calls.load(Ordering::SeqCst), 1);

        let listed = h.orchestrator.list_backends();
        assert_eq!(listed.len(), 2);
    }
}
