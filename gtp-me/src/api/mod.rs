//! HTTP API for the measure engine
//!
//! Request/response types and handlers, grouped by concern. All
//! handlers return the shared `ApiError`, which maps the engine error
//! taxonomy onto HTTP statuses.

pub mod error;
pub mod links;
pub mod plan;
pub mod points;
pub mod sse;

use axum::Json;
use serde::Serialize;

pub use error::ApiError;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
}

/// GET /health - Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "measure_engine".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
