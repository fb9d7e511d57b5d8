use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::model_runtime::BackendInfo;
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<BackendInfo>,
}

/// Registered backends with their descriptors and current lifecycle state.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.orchestrator.list_backends(),
    })
}
