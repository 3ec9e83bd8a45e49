use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use smite_control::TunnelError;
use smite_panel::PanelError;
use tracing::error;

use crate::models::ErrorResponse;

/// Error returned by API handlers
#[derive(Debug)]
pub enum ApiError {
    Tunnel(TunnelError),
    Panel(PanelError),
    /// Request body that does not decode into the handler's type
    Body(JsonRejection),
}

impl From<TunnelError> for ApiError {
    fn from(e: TunnelError) -> Self {
        ApiError::Tunnel(e)
    }
}

impl From<PanelError> for ApiError {
    fn from(e: PanelError) -> Self {
        ApiError::Panel(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::Body(e)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Tunnel(_) | ApiError::Body(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Panel(PanelError::NodeNotConnected(_)) => StatusCode::NOT_FOUND,
            ApiError::Panel(PanelError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Panel(PanelError::Node { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Panel(PanelError::Channel(_) | PanelError::Protocol(_)) => StatusCode::BAD_GATEWAY,
        }
    }

    fn body(&self) -> ErrorResponse {
        match self {
            ApiError::Tunnel(e) => ErrorResponse {
                error: e.to_string(),
                code: e.code().to_string(),
                retryable: e.is_retryable(),
            },
            ApiError::Panel(e) => ErrorResponse {
                error: e.to_string(),
                code: e.code().to_string(),
                retryable: e.is_retryable(),
            },
            ApiError::Body(e) => ErrorResponse {
                error: e.body_text(),
                code: "INVALID_REQUEST".to_string(),
                retryable: false,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.body();
        error!(code = %body.code, status = status.as_u16(), "Request failed: {}", body.error);
        (status, Json(body)).into_response()
    }
}
