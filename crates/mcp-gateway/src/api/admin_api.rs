//! Admin endpoints: runtime routing changes and eager backend loads.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{error_response, ApiJson};
use crate::error::GatewayError;
use crate::model_runtime::BackendInfo;
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct RoutesResponse {
    pub routes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct RouteUpdate {
    pub backend_id: String,
}

#[derive(Debug, Serialize)]
pub struct RouteChanged {
    pub key: String,
    pub backend_id: String,
    pub previous: Option<String>,
}

pub async fn list_routes(State(state): State<AppState>) -> Json<RoutesResponse> {
    Json(RoutesResponse {
        routes: state.orchestrator.routing().routes(),
    })
}

pub async fn put_route(
    State(state): State<AppState>,
    Path(key): Path<String>,
    ApiJson(update): ApiJson<RouteUpdate>,
) -> Response {
    if update.backend_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_route", "backend_id must not be empty");
    }
    let previous = state.orchestrator.routing().add_route(&key, &update.backend_id);
    Json(RouteChanged {
        key,
        backend_id: update.backend_id,
        previous,
    })
    .into_response()
}

pub async fn delete_route(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.orchestrator.routing().remove_route(&key) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "route_not_found", format!("no route named '{}'", key)),
        // Removing the fallback route is a caller mistake, not a server fault
        Err(e @ GatewayError::Config(_)) => error_response(StatusCode::CONFLICT, e.kind(), e.to_string()),
        Err(e) => e.into_response(),
    }
}

pub async fn load_backend(State(state): State<AppState>, Path(backend_id): Path<String>) -> Response {
    if !state.orchestrator.registry().contains(&backend_id) {
        return error_response(
            StatusCode::NOT_FOUND,
            "backend_not_found",
            format!("no backend registered as '{}'", backend_id),
        );
    }
    match state.orchestrator.load_backend(&backend_id).await {
        Ok(info) => Json::<BackendInfo>(info).into_response(),
        Err(e) => e.into_response(),
    }
}
