// Error handling module
// Defines the gateway error taxonomy and HTTP response conversion

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors that can occur during request processing.
///
/// Every variant maps to a machine-readable type string and an HTTP status.
/// Errors raised after a stream has committed are not converted through
/// `IntoResponse`; the streaming bridge degrades them to an in-band
/// `stop_reason: "error"` instead.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Invalid configuration (bad port, non-loopback bind without opt-in)
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    /// No account is logged in
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// Token refresh or upstream authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Token store exists but cannot be parsed
    #[error("Token store corrupt: {0}")]
    TokenStoreCorrupt(String),

    /// All upstream endpoints are rate limited
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Seconds until the soonest endpoint frees up
        retry_after: Option<u64>,
    },

    /// Upstream returned an error status that is not retryable (or retries ran out)
    #[error("Upstream error: {status} - {message}")]
    Upstream { status: u16, message: String },

    /// No endpoint answered after retries were exhausted
    #[error("Upstream unavailable: {0}")]
    EndpointUnavailable(String),

    /// Tool declaration could not be coerced to an object schema
    #[error("Invalid tool schema: {0}")]
    SchemaInvalid(String),

    /// Stream framing broke beyond the tolerated bound
    #[error("Malformed upstream chunk: {0}")]
    MalformedChunk(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested model alias could not be routed
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// Per-read idle timeout or whole-request deadline elapsed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Client went away; terminates upstream work, never sent to the client
    #[error("Client cancelled")]
    ClientCancelled,

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Machine-readable error type for wire bodies and logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::ConfigInvalid(_) => "config_invalid",
            ApiError::AuthRequired(_) => "auth_required",
            ApiError::AuthFailed(_) => "auth_failed",
            ApiError::TokenStoreCorrupt(_) => "token_store_corrupt",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Upstream { status, .. } if *status >= 500 => "upstream_5xx",
            ApiError::Upstream { .. } => "upstream_4xx_other",
            ApiError::EndpointUnavailable(_) => "endpoint_unavailable",
            ApiError::SchemaInvalid(_) => "schema_invalid",
            ApiError::MalformedChunk(_) => "malformed_chunk",
            ApiError::Validation(_) => "invalid_request_error",
            ApiError::InvalidModel(_) => "invalid_model",
            ApiError::DeadlineExceeded => "deadline_exceeded",
            ApiError::ClientCancelled => "client_cancelled",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::AuthRequired(_) | ApiError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            ApiError::TokenStoreCorrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream { status, .. } => {
                if *status >= 500 {
                    StatusCode::BAD_GATEWAY
                } else {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
            }
            ApiError::EndpointUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::SchemaInvalid(_) | ApiError::Validation(_) | ApiError::InvalidModel(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::MalformedChunk(_) => StatusCode::BAD_GATEWAY,
            ApiError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            // A cancelled client never sees this; pick something sensible anyway.
            ApiError::ClientCancelled => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();

        let (message, retry_after) = match &self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                ("Internal server error".to_string(), None)
            }
            ApiError::RateLimited {
                message,
                retry_after,
            } => (message.clone(), *retry_after),
            other => (other.to_string(), None),
        };

        let body = Json(json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
