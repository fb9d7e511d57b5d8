//! Server startup
//!
//! Builds every component from [`Config`] once, wires them into explicit
//! objects (no process-wide singletons) and serves the HTTP surface. Startup
//! misconfiguration is the only fatal path; everything after that is
//! reported per request.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::{
    config::Config,
    context_engine::{ChatOrchestrator, OrchestratorConfig},
    context_store::build_context_store,
    model_runtime::{BackendRegistry, LocalBackendConfig, LocalModelBackend, ModelBackend, RoutingPolicy},
    shared_state::AppState,
    worker_threads::{SweepHandle, SweepWorker},
};

const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// The two local families this gateway ships with.
pub fn build_backends(cfg: &Config) -> Vec<Arc<dyn ModelBackend>> {
    let local = |model_path: &std::path::Path, endpoint: &str| LocalBackendConfig {
        model_path: model_path.to_path_buf(),
        endpoint: endpoint.to_string(),
        runtime_binary: cfg.llama_bin.clone(),
        load_timeout: cfg.backend_load_timeout(),
        request_timeout: cfg.generate_timeout(),
    };

    let deepseek = LocalModelBackend::deepseek(local(&cfg.deepseek_model_path, &cfg.deepseek_endpoint));
    let llama = LocalModelBackend::llama(local(&cfg.llama_model_path, &cfg.llama_endpoint));
    vec![Arc::new(deepseek) as Arc<dyn ModelBackend>, Arc::new(llama)]
}

/// Registry, routing, store and orchestrator for `cfg`, plus the running sweeper.
pub async fn build_app_state(
    cfg: Config,
    backends: Vec<Arc<dyn ModelBackend>>,
) -> anyhow::Result<(AppState, SweepHandle)> {
    let registry = Arc::new(BackendRegistry::new());
    for backend in backends {
        let id = backend.descriptor().id;
        registry.register(&id, backend);
    }

    let routing = Arc::new(RoutingPolicy::new(cfg.model_routing.clone(), Arc::clone(&registry)));
    routing.validate().context("routing table is unusable")?;

    let store = build_context_store(&cfg)
        .await
        .with_context(|| format!("failed to open '{}' context storage", cfg.storage.name()))?;
    let sweeper = SweepWorker::new(Arc::clone(&store), cfg.sweep_interval()).spawn();

    let orchestrator = Arc::new(ChatOrchestrator::new(
        store,
        registry,
        routing,
        OrchestratorConfig::from_config(&cfg),
    ));

    Ok((AppState::new(orchestrator, Arc::new(cfg)), sweeper))
}

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing(cfg.debug);
    crate::metrics::init_metrics();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let backends = build_backends(&cfg);
    let (state, sweeper) = build_app_state(cfg, backends).await?;
    let app = build_router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

pub fn build_router(state: AppState) -> axum::Router {
    use axum::{
        extract::{DefaultBodyLimit, State},
        routing::{delete, get, post, put},
        Json, Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    let api = Router::new()
        .route("/chat", post(crate::api::chat))
        .route("/models", get(crate::api::list_models))
        .route("/sessions/:id", delete(crate::api::delete_session))
        .route("/admin/routes", get(crate::api::list_routes))
        .route("/admin/routes/:key", put(crate::api::put_route).delete(crate::api::delete_route))
        .route("/admin/backends/:id/load", post(crate::api::load_backend));

    let prefix = state.config.api_prefix.trim_end_matches('/').to_string();
    let router = if prefix.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(&prefix, api)
    };

    // Outer deadline; generation enforces its own, tighter one
    let request_timeout = state.config.generate_timeout() + Duration::from_secs(30);

    router
        .route(
            "/",
            get(|State(state): State<AppState>| async move {
                Json(serde_json::json!({
                    "message": format!("Welcome to {}", state.config.app_name),
                }))
            }),
        )
        .route("/healthz", get(|| async { "OK" }))
        .route("/metrics", get(crate::metrics::get_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}
