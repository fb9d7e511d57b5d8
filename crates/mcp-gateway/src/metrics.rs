use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static CHAT_REQUESTS: OnceLock<IntCounterVec> = OnceLock::new();
static BACKEND_LOADS: OnceLock<IntCounterVec> = OnceLock::new();
static GENERATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

fn install<T>(cell: &OnceLock<T>, metric: prometheus::Result<T>)
where
    T: Collector + Clone + 'static,
{
    match metric {
        Ok(metric) => {
            if cell.set(metric.clone()).is_ok() {
                REGISTRY.register(Box::new(metric)).ok();
            }
        }
        Err(e) => warn!("Failed to create metric: {}", e),
    }
}

pub fn init_metrics() {
    install(
        &CHAT_REQUESTS,
        IntCounterVec::new(
            prometheus::opts!("chat_requests_total", "Chat turns per backend and outcome"),
            &["backend", "status"],
        ),
    );
    install(
        &BACKEND_LOADS,
        IntCounterVec::new(
            prometheus::opts!("backend_loads_total", "Backend load attempts per outcome"),
            &["backend", "outcome"],
        ),
    );
    install(
        &GENERATION_SECONDS,
        HistogramVec::new(
            HistogramOpts::new("generation_seconds", "Backend generation latency")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["backend"],
        ),
    );
}

pub fn inc_chat(backend: &str, status: &str) {
    if let Some(counter) = CHAT_REQUESTS.get() {
        counter.with_label_values(&[backend, status]).inc();
    }
}

pub fn inc_backend_load(backend: &str, outcome: &str) {
    if let Some(counter) = BACKEND_LOADS.get() {
        counter.with_label_values(&[backend, outcome]).inc();
    }
}

pub fn observe_generation(backend: &str, seconds: f64) {
    if let Some(histogram) = GENERATION_SECONDS.get() {
        histogram.with_label_values(&[backend]).observe(seconds);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            format!("failed to encode metrics: {}", e).into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
