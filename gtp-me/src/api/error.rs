//! HTTP mapping for the engine error taxonomy

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gtp_common::Error;
use serde_json::json;
use tracing::error;

/// Wrapper turning `gtp_common::Error` into an HTTP response
///
/// Validation -> 422, Conflict -> 409, NotFound -> 404, everything
/// infrastructural -> 500. The discriminated kind is part of the body so
/// callers can branch without parsing messages.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            Error::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Database(_) | Error::Io(_) | Error::Config(_) | Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Internal error in request handler: {}", self.0);
        }

        let body = Json(json!({
            "error": kind,
            "message": self.0.to_string(),
        }));

        (status, body).into_response()
    }
}
