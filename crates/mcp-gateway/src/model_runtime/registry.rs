//! Backend Registry
//!
//! Maps backend ids to backend handles and drives their lazy load lifecycle.
//! Lifecycle state is published through `ArcSwap` so listing never blocks on a
//! load in progress; loads themselves are serialized per backend by an async
//! gate, which collapses concurrent first callers into a single `load()`.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::runtime_trait::{BackendInfo, LifecycleState, ModelBackend};
use crate::error::{GatewayError, GatewayResult};

struct BackendEntry {
    backend: Arc<dyn ModelBackend>,
    state: ArcSwap<LifecycleState>,
    /// Held for the duration of a load attempt.
    load_gate: Mutex<()>,
    /// Number of load attempts that have finished, successful or not.
    completed_loads: AtomicU64,
}

impl BackendEntry {
    fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            state: ArcSwap::from_pointee(LifecycleState::Unloaded),
            load_gate: Mutex::new(()),
            completed_loads: AtomicU64::new(0),
        }
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            descriptor: self.backend.descriptor(),
            state: (**self.state.load()).clone(),
        }
    }
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: DashMap<String, Arc<BackendEntry>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a backend under `id`. Never overwrites: returns `false` if taken.
    pub fn register(&self, id: &str, backend: Arc<dyn ModelBackend>) -> bool {
        match self.backends.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!("Backend '{}' already registered, ignoring", id);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(BackendEntry::new(backend)));
                info!("Registered backend '{}'", id);
                true
            }
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.backends.remove(id).is_some();
        if removed {
            info!("Unregistered backend '{}'", id);
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelBackend>> {
        self.backends.get(id).map(|entry| Arc::clone(&entry.backend))
    }

    pub fn state(&self, id: &str) -> Option<LifecycleState> {
        self.backends.get(id).map(|entry| (**entry.state.load()).clone())
    }

    /// Snapshot of every registered backend, sorted by id.
    pub fn list(&self) -> Vec<BackendInfo> {
        let mut infos: Vec<BackendInfo> = self.backends.iter().map(|entry| entry.info()).collect();
        infos.sort_by(|a, b| a.descriptor.id.cmp(&b.descriptor.id));
        infos
    }

    /// Returns the backend once it is `ready`, loading it first if needed.
    ///
    /// Callers that queue behind an in-flight load observe that load's
    /// outcome. A `failed` backend is retried by the next caller that did not
    /// itself wait on the failed attempt.
    pub async fn ensure_ready(&self, id: &str) -> GatewayResult<Arc<dyn ModelBackend>> {
        let entry = self
            .backends
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::BackendLoadFailed {
                id: id.to_string(),
                cause: "backend is not registered".to_string(),
            })?;

        if entry.state.load().is_ready() {
            return Ok(Arc::clone(&entry.backend));
        }

        let seen_loads = entry.completed_loads.load(Ordering::Acquire);
        let _gate = entry.load_gate.lock().await;

        match &**entry.state.load() {
            LifecycleState::Ready => return Ok(Arc::clone(&entry.backend)),
            LifecycleState::Failed { cause }
                if entry.completed_loads.load(Ordering::Acquire) != seen_loads =>
            {
                return Err(GatewayError::BackendLoadFailed {
                    id: id.to_string(),
                    cause: cause.clone(),
                });
            }
            _ => {}
        }

        info!("Loading backend '{}'", id);
        entry.state.store(Arc::new(LifecycleState::Loading));

        let outcome = entry.backend.load().await;
        let result = match outcome {
            Ok(()) => {
                entry.state.store(Arc::new(LifecycleState::Ready));
                info!("Backend '{}' is ready", id);
                Ok(Arc::clone(&entry.backend))
            }
            Err(e) => {
                let cause = format!("{:#}", e);
                error!("Backend '{}' failed to load: {}", id, cause);
                entry.state.store(Arc::new(LifecycleState::Failed { cause: cause.clone() }));
                Err(GatewayError::BackendLoadFailed { id: id.to_string(), cause })
            }
        };
        entry.completed_loads.fetch_add(1, Ordering::AcqRel);

        #[cfg(feature = "cli")]
        crate::metrics::inc_backend_load(id, if result.is_ok() { "ready" } else { "failed" });

        result
    }

    /// Runs the backend's unload hook and resets it to `unloaded`.
    pub async fn unload(&self, id: &str) -> GatewayResult<bool> {
        let Some(entry) = self.backends.get(id).map(|entry| Arc::clone(entry.value())) else {
            return Ok(false);
        };

        let _gate = entry.load_gate.lock().await;
        if let Err(e) = entry.backend.unload().await {
            warn!("Backend '{}' unload hook failed: {:#}", id, e);
        }
        entry.state.store(Arc::new(LifecycleState::Unloaded));
        info!("Backend '{}' unloaded", id);
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::Message;
    use crate::model_runtime::{BackendDescriptor, GenerationParameters};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    /// Scriptable backend used across the crate's tests.
    pub(crate) struct StubBackend {
        pub id: String,
        pub reply: String,
        pub load_calls: AtomicUsize,
        pub generate_calls: AtomicUsize,
        pub load_delay: Duration,
        pub generate_delay: Duration,
        pub fail_load: AtomicBool,
        pub fail_generate: AtomicBool,
        /// Transcript and parameters of the most recent `generate` call.
        pub last_call: std::sync::Mutex<Option<(Vec<Message>, GenerationParameters)>>,
    }

    impl StubBackend {
        pub(crate) fn new(id: &str, reply: &str) -> Self {
            Self {
                id: id.to_string(),
                reply: reply.to_string(),
                load_calls: AtomicUsize::new(0),
                generate_calls: AtomicUsize::new(0),
                load_delay: Duration::ZERO,
                generate_delay: Duration::ZERO,
                fail_load: AtomicBool::new(false),
                fail_generate: AtomicBool::new(false),
                last_call: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ModelBackend for StubBackend {
        fn descriptor(&self) -> BackendDescriptor {
            BackendDescriptor {
                id: self.id.clone(),
                name: format!("{} stub", self.id),
                description: "test backend".to_string(),
                capabilities: vec!["text-generation".to_string()],
                languages: vec!["en".to_string()],
            }
        }

        async fn load(&self) -> anyhow::Result<()> {
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.load_delay).await;
            if self.fail_load.load(Ordering::SeqCst) {
                anyhow::bail!("weights missing");
            }
            Ok(())
        }

        async fn generate(
            &self,
            transcript: &[Message],
            parameters: &GenerationParameters,
        ) -> anyhow::Result<String> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_call.lock().unwrap() = Some((transcript.to_vec(), parameters.clone()));
            tokio::time::sleep(self.generate_delay).await;
            if self.fail_generate.load(Ordering::SeqCst) {
                anyhow::bail!("CUDA out of memory");
            }
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn register_refuses_to_overwrite() {
        let registry = BackendRegistry::new();
        assert!(registry.register("a", Arc::new(StubBackend::new("a", "x"))));
        assert!(!registry.register("a", Arc::new(StubBackend::new("a", "y"))));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn unregister_reports_presence() {
        let registry = BackendRegistry::new();
        registry.register("a", Arc::new(StubBackend::new("a", "x")));
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn list_reports_descriptor_and_state() {
        let registry = BackendRegistry::new();
        registry.register("b", Arc::new(StubBackend::new("b", "x")));
        registry.register("a", Arc::new(StubBackend::new("a", "x")));

        let infos = registry.list();
        assert_eq!(infos[0].descriptor.id, "a");
        assert_eq!(infos[1].descriptor.id, "b");
        assert!(infos.iter().all(|i| i.state == LifecycleState::Unloaded));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_callers_trigger_a_single_load() {
        let registry = Arc::new(BackendRegistry::new());
        let mut stub = StubBackend::new("a", "x");
        stub.load_delay = Duration::from_millis(50);
        let stub = Arc::new(stub);
        registry.register("a", stub.clone());

        let calls = (0..16).map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.ensure_ready("a").await.is_ok() })
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.into_iter().all(|r| r.unwrap()));
        assert_eq!(stub.load_calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state("a"), Some(LifecycleState::Ready));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_observe_the_failed_load_they_waited_on() {
        let registry = Arc::new(BackendRegistry::new());
        let mut stub = StubBackend::new("a", "x");
        stub.load_delay = Duration::from_millis(50);
        stub.fail_load.store(true, Ordering::SeqCst);
        let stub = Arc::new(stub);
        registry.register("a", stub.clone());

        let calls = (0..8).map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.ensure_ready("a").await })
        });
        for result in futures::future::join_all(calls).await {
            let err = result.unwrap().err().unwrap();
            assert!(matches!(err, GatewayError::BackendLoadFailed { .. }));
        }
        assert_eq!(stub.load_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(registry.state("a"), Some(LifecycleState::Failed { .. })));
    }

    #[tokio::test]
    async fn failed_backend_is_retried_on_next_call() {
        let registry = BackendRegistry::new();
        let stub = Arc::new(StubBackend::new("a", "x"));
        stub.fail_load.store(true, Ordering::SeqCst);
        registry.register("a", stub.clone());

        let err = registry.ensure_ready("a").await.err().unwrap();
        assert!(err.to_string().contains("weights missing"));

        stub.fail_load.store(false, Ordering::SeqCst);
        registry.ensure_ready("a").await.unwrap();
        assert_eq!(stub.load_calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.state("a"), Some(LifecycleState::Ready));
    }

    #[tokio::test]
    async fn ensure_ready_on_unknown_backend_fails() {
        let registry = BackendRegistry::new();
        let err = registry.ensure_ready("ghost").await.err().unwrap();
        assert!(matches!(err, GatewayError::BackendLoadFailed { ref id, .. } if id == "ghost"));
    }

    #[tokio::test]
    async fn unload_resets_state_and_next_use_reloads() {
        let registry = BackendRegistry::new();
        let stub = Arc::new(StubBackend::new("a", "x"));
        registry.register("a", stub.clone());

        registry.ensure_ready("a").await.unwrap();
        assert!(registry.unload("a").await.unwrap());
        assert_eq!(registry.state("a"), Some(LifecycleState::Unloaded));

        registry.ensure_ready("a").await.unwrap();
        assert_eq!(stub.load_calls.load(Ordering::SeqCst), 2);
        assert!(!registry.unload("ghost").await.unwrap());
    }
}
