//! HTTP-facing error type. Every variant renders as a JSON body with an
//! `error` key, and `details` where there is more to say.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("{0}")]
    NotConfigured(String),

    /// Upstream answered with a non-success status, or could not be reached.
    #[error("{message}")]
    Upstream {
        status: StatusCode,
        message: String,
        details: Option<String>,
    },

    #[error("{0}")]
    GatewayTimeout(String),

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Upstream { status, .. } => *status,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Relay an upstream error status when it is a client or server error;
    /// anything else (1xx/3xx, or a 2xx we refused) becomes 502.
    pub fn upstream(status: u16, message: impl Into<String>, details: Option<String>) -> Self {
        let status = StatusCode::from_u16(status)
            .ok()
            .filter(|s| s.is_client_error() || s.is_server_error())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        ApiError::Upstream { status, message: message.into(), details }
    }

    pub fn bad_gateway(message: impl Into<String>, details: impl Into<String>) -> Self {
        ApiError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let details = match &self {
            ApiError::Upstream { details, .. } => details.as_deref(),
            _ => None,
        };
        let body = ErrorBody { error: &message, details };
        (self.status(), Json(body)).into_response()
    }
}
