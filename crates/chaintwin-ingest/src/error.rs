//! Error types for the read API.
//!
//! [`ApiError`] converts into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chaintwin_db::DbError;

/// Errors that can occur in the read API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path parameter was invalid.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The cache or store could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(#[from] DbError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Unavailable(e) => {
                tracing::warn!(error = %e, "Read API store failure");
                (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
