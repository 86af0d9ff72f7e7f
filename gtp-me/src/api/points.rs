//! Data point lifecycle endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use gtp_common::db::models::{DataPoint, DataPointCategory};
use gtp_common::Error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ApiError;
use crate::datapoints::{self, NewActual, NewTarget, RecordedActual, TargetUpsert};
use crate::AppContext;

#[derive(Debug, Deserialize)]
pub struct BatchUpsertRequest {
    pub items: Vec<TargetUpsert>,
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub points: Vec<DataPoint>,
}

#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    pub category: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTargetRequest {
    pub value: f64,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateActualRequest {
    pub value: f64,
    pub comment: String,
}

/// POST /links/:id/targets - Create a single target point
pub async fn create_target(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
    Json(req): Json<NewTarget>,
) -> Result<Json<DataPoint>, ApiError> {
    let point = datapoints::create_target(&ctx.db, link_id, req).await?;
    Ok(Json(point))
}

/// POST /links/:id/targets/batch - Upsert target points as one unit
pub async fn batch_upsert_targets(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
    Json(req): Json<BatchUpsertRequest>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let points = datapoints::batch_upsert_targets(&ctx.db, link_id, req.items).await?;
    Ok(Json(SeriesResponse { points }))
}

/// PUT /links/:id/targets/:point_id - Correct a target value
pub async fn update_target(
    State(ctx): State<AppContext>,
    Path((link_id, point_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateTargetRequest>,
) -> Result<Json<DataPoint>, ApiError> {
    let point = datapoints::get_point(&ctx.db, point_id).await?;
    if point.link_id != link_id {
        return Err(Error::NotFound(format!("data point {}", point_id)).into());
    }
    let point = datapoints::update_target(&ctx.db, point_id, req.value, req.rationale).await?;
    Ok(Json(point))
}

/// POST /links/:id/actuals - Record an actual reading
///
/// The response embeds the variance computed against the current
/// Expected series; variance is derived, never stored.
pub async fn record_actual(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
    Json(req): Json<NewActual>,
) -> Result<Json<RecordedActual>, ApiError> {
    let recorded = datapoints::record_actual(&ctx.db, &ctx.events, link_id, req).await?;
    Ok(Json(recorded))
}

/// PUT /links/:id/actuals/:point_id - Correct an actual reading
pub async fn update_actual(
    State(ctx): State<AppContext>,
    Path((link_id, point_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateActualRequest>,
) -> Result<Json<DataPoint>, ApiError> {
    let point = datapoints::get_point(&ctx.db, point_id).await?;
    if point.link_id != link_id {
        return Err(Error::NotFound(format!("data point {}", point_id)).into());
    }
    let point = datapoints::update_actual(&ctx.db, point_id, req.value, &req.comment).await?;
    Ok(Json(point))
}

/// GET /links/:id/series - Ordered data point series
pub async fn get_series(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
    Query(query): Query<SeriesQuery>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let category = DataPointCategory::from_db(&query.category).ok_or_else(|| {
        Error::Validation(format!("invalid category '{}'", query.category))
    })?;

    let points = datapoints::get_series(
        &ctx.db,
        link_id,
        category,
        query.subtype.as_deref(),
        query.from,
        query.to,
    )
    .await?;
    Ok(Json(SeriesResponse { points }))
}
