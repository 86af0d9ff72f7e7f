//! gtp-me library - Measure Planning & Variance Engine module
//!
//! Hosts the link registry, data point store, variance calculation,
//! replan engine, and cross-context impact aggregation behind an HTTP
//! API consumed by the platform CRUD layer.

use axum::Router;
use gtp_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub mod alignment;
pub mod api;
pub mod datapoints;
pub mod impact;
pub mod registry;
pub mod replan;
pub mod variance;

use alignment::AlignmentClient;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppContext {
    pub db: SqlitePool,
    pub events: Arc<EventBus>,
    pub alignment: AlignmentClient,
}

impl AppContext {
    /// Create new application context
    pub fn new(db: SqlitePool, events: Arc<EventBus>, alignment: AlignmentClient) -> Self {
        Self { db, events, alignment }
    }
}

/// Build application router
pub fn build_router(ctx: AppContext) -> Router {
    use axum::routing::{delete, get, post, put};

    Router::new()
        // Health endpoint
        .route("/health", get(api::health))
        // Link lifecycle
        .route("/links", post(api::links::create_link))
        .route("/links", get(api::links::list_links))
        .route("/links/:id", get(api::links::get_link))
        .route("/links/:id", delete(api::links::unlink))
        .route("/links/:id/metadata", put(api::links::update_metadata))
        .route("/links/:id/primary", post(api::links::set_primary))
        // Data point lifecycle
        .route("/links/:id/targets", post(api::points::create_target))
        .route("/links/:id/targets/batch", post(api::points::batch_upsert_targets))
        .route("/links/:id/targets/:point_id", put(api::points::update_target))
        .route("/links/:id/actuals", post(api::points::record_actual))
        .route("/links/:id/actuals/:point_id", put(api::points::update_actual))
        .route("/links/:id/series", get(api::points::get_series))
        // Planning and replanning
        .route("/links/:id/plan", get(api::plan::plan_overview))
        .route("/links/:id/replan", post(api::plan::apply_replan))
        .route("/links/:id/replan/dismiss", post(api::plan::dismiss_replan))
        // Impact read
        .route("/measures/:id/impact", get(api::plan::measure_impact))
        // SSE event stream
        .route("/events", get(api::sse::event_stream))
        // Attach application context
        .with_state(ctx)
        // Enable CORS for local access
        .layer(CorsLayer::permissive())
}
