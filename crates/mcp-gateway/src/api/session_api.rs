use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use tracing::info;

use crate::error::GatewayError;
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, GatewayError> {
    info!("Deleting session: {}", session_id);
    state.orchestrator.delete_session(&session_id).await?;
    Ok(Json(StatusResponse {
        status: "success".to_string(),
        message: format!("Session {} deleted", session_id),
    }))
}
