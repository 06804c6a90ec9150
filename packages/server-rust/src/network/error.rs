//! JSON error responses for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use storinfo_core::{QueryError, QueryErrorKind};

/// Every error a handler can return to a client.
///
/// Rendered as `{"code": ..., "message": ...}` with a status derived from
/// the variant.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Query(#[from] QueryError),

    /// The query string could not be decoded at all.
    #[error("invalid query string: {0}")]
    BadQueryString(String),

    #[error("{method} {path} does not exist")]
    RouteNotFound { method: String, path: String },

    #[error("server is shutting down")]
    ShuttingDown,
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Query(e) => match e.kind() {
                QueryErrorKind::Validation => StatusCode::BAD_REQUEST,
                QueryErrorKind::NotFound => StatusCode::NOT_FOUND,
            },
            Self::BadQueryString(_) => StatusCode::BAD_REQUEST,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Query(e) => e.code(),
            Self::BadQueryString(_) => "InvalidQuery",
            Self::RouteNotFound { .. } => "ResourceNotFound",
            Self::ShuttingDown => "ServiceUnavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
