//! API module - HTTP surface over the chat orchestrator

pub mod chat_api;
pub mod model_api;
pub mod session_api;
pub mod admin_api;

pub use chat_api::chat;
pub use model_api::{list_models, ModelsResponse};
pub use session_api::delete_session;
pub use admin_api::{delete_route, list_routes, load_backend, put_route};

use axum::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::GatewayError;

/// Body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            error: kind.to_string(),
            message: message.into(),
        }
    }
}

pub(crate) fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody::new(kind, message))).into_response()
}

/// Seconds a client should wait before retrying a transient failure.
const RETRY_AFTER_SECS: &str = "1";

/// JSON body extractor whose rejections speak the gateway's error format.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => {
                debug!("Rejected request body: {}", rejection.body_text());
                Err(GatewayError::InvalidParameters(rejection.body_text()))
            }
        }
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            GatewayError::BackendLoadFailed { .. }
            | GatewayError::GenerationFailed { .. }
            | GatewayError::RoutingKeyUnresolvable(_)
            | GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed ({}): {}", self.kind(), self);
        }
        let mut response = error_response(status, self.kind(), self.to_string());
        if self.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}
