//! Errors the proxy reports itself, as opposed to upstream responses it relays.
//!
//! Upstream failures never surface here: the batcher turns them into ordinary
//! [`UpstreamResponse`](collapse_server::UpstreamResponse)s so that every
//! member of a batch observes the same outcome. What remains are the cases
//! where the proxy cannot take part at all, answered with a JSON body:
//!
//! ```json
//! {"code":"service_unavailable","message":"proxy is shutting down"}
//! ```

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use collapse_server::BatcherError;

/// Error codes carried in the `code` field of a proxy error body.
pub mod error_codes {
    /// Request could not be read or forwarded as given.
    pub const BAD_REQUEST: &str = "bad_request";
    /// Request body exceeds the configured limit.
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    /// The batcher no longer accepts requests.
    pub const SERVICE_UNAVAILABLE: &str = "service_unavailable";
}

/// JSON error body returned by the proxy.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a bad request error (400).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(error_codes::BAD_REQUEST, message)
    }

    /// Creates a payload too large error (413).
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(error_codes::PAYLOAD_TOO_LARGE, message)
    }

    /// Creates a service unavailable error (503).
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(error_codes::SERVICE_UNAVAILABLE, message)
    }

    /// HTTP status for this error's code.
    pub fn status(&self) -> StatusCode {
        use error_codes::*;

        match self.code.as_str() {
            BAD_REQUEST => StatusCode::BAD_REQUEST,
            PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            SERVICE_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<BatcherError> for ApiError {
    fn from(err: BatcherError) -> Self {
        match err {
            BatcherError::Closed => ApiError::service_unavailable("proxy is shutting down"),
            // The request was accepted but its batch was torn down before a
            // result was produced, which only happens during shutdown.
            BatcherError::Dropped => {
                ApiError::service_unavailable("request was abandoned before completion")
            }
        }
    }
}
