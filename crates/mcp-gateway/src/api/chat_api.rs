//! Chat endpoint: one turn per request.

use axum::extract::State;
use axum::Json;
use tracing::info;

use super::ApiJson;
use crate::context_engine::{ChatRequest, ChatResponse};
use crate::error::GatewayError;
use crate::shared_state::AppState;

pub async fn chat(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ChatRequest>,
) -> Result<Json<ChatResponse>, GatewayError> {
    info!(
        "Chat request: session={}, model={}, {} message(s)",
        request.session_id.as_deref().unwrap_or("<new>"),
        request.model.as_deref().unwrap_or("default"),
        request.messages.len()
    );

    let response = state.orchestrator.handle_turn(request).await?;
    Ok(Json(response))
}
