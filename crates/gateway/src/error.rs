//! Turns classified pipeline failures into HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::warn;

use nosrelay_core::Error;

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A pipeline failure on its way to the caller.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let classification = self.0.classify();
        warn!(
            kind = %self.0.kind(),
            status = classification.status,
            error = %self.0,
            "Request failed before streaming"
        );
        let status = StatusCode::from_u16(classification.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: classification.reason,
            message: classification.message,
        };
        (status, Json(body)).into_response()
    }
}
