//! Planning read, replan operations, and impact read

use axum::{
    extract::{Path, Query, State},
    Json,
};
use gtp_common::db::models::{DataPoint, MeasureLink, TargetSubtype};
use gtp_common::Error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ApiError;
use crate::datapoints;
use crate::impact::{self, ImpactRow};
use crate::registry;
use crate::replan::{self, ReplanOutcome, ReplanPolicy, ReplanRequest};
use crate::variance::{self, Direction, PlanSummary};
use crate::AppContext;

#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    /// Which way the measure improves; defaults to up
    #[serde(default)]
    pub direction: Option<String>,
}

/// Planning read: all three target series, the actual series, and a
/// computed summary
#[derive(Debug, Serialize)]
pub struct PlanOverview {
    pub link: MeasureLink,
    pub expected: Vec<DataPoint>,
    pub optimal: Vec<DataPoint>,
    pub minimal: Vec<DataPoint>,
    pub actuals: Vec<DataPoint>,
    pub summary: PlanSummary,
}

#[derive(Debug, Serialize)]
pub struct ImpactResponse {
    pub measure_id: Uuid,
    pub rows: Vec<ImpactRow>,
}

/// GET /links/:id/plan
pub async fn plan_overview(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
    Query(query): Query<PlanQuery>,
) -> Result<Json<PlanOverview>, ApiError> {
    let direction = match query.direction.as_deref() {
        None => Direction::Up,
        Some(raw) => Direction::from_str(raw)
            .ok_or_else(|| Error::Validation(format!("invalid direction '{}'", raw)))?,
    };

    let link = registry::get_link(&ctx.db, link_id).await?;
    let policy = ReplanPolicy::load_for_link(&ctx.db, &link).await;

    let mut expected = Vec::new();
    let mut optimal = Vec::new();
    let mut minimal = Vec::new();
    for point in datapoints::get_series(
        &ctx.db,
        link_id,
        gtp_common::db::models::DataPointCategory::Target,
        None,
        None,
        None,
    )
    .await?
    {
        match point.target_subtype() {
            Some(TargetSubtype::Expected) => expected.push(point),
            Some(TargetSubtype::Optimal) => optimal.push(point),
            Some(TargetSubtype::Minimal) => minimal.push(point),
            None => {}
        }
    }

    let actuals = datapoints::actual_points(&ctx.db, link_id).await?;
    let expected_series: Vec<_> = expected
        .iter()
        .map(|p| (p.effective_date, p.value))
        .collect();
    let summary = variance::summarize(
        &expected_series,
        &actuals,
        policy.method,
        policy.threshold_pct,
        direction,
    );

    Ok(Json(PlanOverview {
        link,
        expected,
        optimal,
        minimal,
        actuals,
        summary,
    }))
}

/// POST /links/:id/replan - Apply an adjustment strategy
pub async fn apply_replan(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
    Json(req): Json<ReplanRequest>,
) -> Result<Json<ReplanOutcome>, ApiError> {
    let outcome = replan::apply_adjustment(&ctx.db, &ctx.events, link_id, req).await?;
    Ok(Json(outcome))
}

/// POST /links/:id/replan/dismiss - Acknowledge a flag without changes
pub async fn dismiss_replan(
    State(ctx): State<AppContext>,
    Path(link_id): Path<Uuid>,
) -> Result<Json<MeasureLink>, ApiError> {
    let link = replan::dismiss(&ctx.db, &ctx.events, link_id).await?;
    Ok(Json(link))
}

/// GET /measures/:id/impact - Per-goal impact rows for a measure
pub async fn measure_impact(
    State(ctx): State<AppContext>,
    Path(measure_id): Path<Uuid>,
) -> Result<Json<ImpactResponse>, ApiError> {
    let rows = impact::measure_impact(&ctx.db, &ctx.alignment, measure_id).await?;
    Ok(Json(ImpactResponse { measure_id, rows }))
}
