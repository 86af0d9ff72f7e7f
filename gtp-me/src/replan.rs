//! Replan Engine
//!
//! Per-link state machine: normal -> flagged (sustained variance) ->
//! adjusted (explicit operation, re-enters normal) or dismissed
//! (acknowledged, no change). Adjustments only ever touch Expected
//! target points dated at or after the triggering actual; past points
//! are immutable history. Every adjustment is recorded in the
//! replan_adjustments audit table inside the same transaction that
//! rewrites the series.

use chrono::{NaiveDate, Utc};
use gtp_common::db::models::{MeasureLink, ReplanState};
use gtp_common::db::settings::get_setting_or;
use gtp_common::events::{EngineEvent, EventBus};
use gtp_common::interpolate::{InterpolationMethod, SeriesPoint};
use gtp_common::uuid_utils;
use gtp_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::datapoints;
use crate::registry;

/// How the future Expected series is recomputed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentStrategy {
    /// Keep the final target; reconnect the latest actual to it
    MaintainFinalGoal,
    /// Shift every future point by the observed delta
    ProportionalShift,
    /// Caller supplies the replacement series
    Custom,
}

impl AdjustmentStrategy {
    pub fn as_db_string(&self) -> &'static str {
        match self {
            AdjustmentStrategy::MaintainFinalGoal => "maintain_final_goal",
            AdjustmentStrategy::ProportionalShift => "proportional_shift",
            AdjustmentStrategy::Custom => "custom",
        }
    }
}

/// Replanning policy resolved for one link
///
/// The threshold comes from the link when set, otherwise from the
/// `default_variance_threshold_pct` setting; the consecutive-breach
/// count and interpolation method are engine-wide settings.
#[derive(Debug, Clone, Copy)]
pub struct ReplanPolicy {
    pub threshold_pct: f64,
    pub required_consecutive: u32,
    pub method: InterpolationMethod,
}

impl ReplanPolicy {
    pub async fn load_for_link(pool: &SqlitePool, link: &MeasureLink) -> Self {
        let default_threshold =
            get_setting_or(pool, "default_variance_threshold_pct", 10.0).await;
        let required_consecutive = get_setting_or(pool, "replan_consecutive_breaches", 2u32).await;
        let method_raw =
            get_setting_or(pool, "interpolation_method", "linear".to_string()).await;
        let method = InterpolationMethod::from_str(&method_raw).unwrap_or_default();

        ReplanPolicy {
            threshold_pct: link.threshold_pct.unwrap_or(default_threshold),
            required_consecutive,
            method,
        }
    }
}

/// A replacement target point for the custom strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CustomPoint {
    pub effective_date: NaiveDate,
    pub value: f64,
}

/// Request to apply an adjustment to a flagged link
#[derive(Debug, Clone, Deserialize)]
pub struct ReplanRequest {
    pub strategy: AdjustmentStrategy,
    /// Actual reading the adjustment is based on
    pub basis_actual_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub adjusted_by: Option<String>,
    /// Replacement series; required for (and only for) `custom`
    #[serde(default)]
    pub points: Option<Vec<CustomPoint>>,
}

/// Result of an applied adjustment
#[derive(Debug, Clone, Serialize)]
pub struct ReplanOutcome {
    pub adjustment_id: Uuid,
    pub strategy: AdjustmentStrategy,
    pub points_before: Vec<CustomPoint>,
    pub points_after: Vec<CustomPoint>,
}

/// Apply an adjustment strategy to a flagged link
///
/// Recomputes Expected points dated >= the basis actual's date, records
/// the audit row, resets the link to normal, and clears breach
/// bookkeeping - all in one transaction.
pub async fn apply_adjustment(
    pool: &SqlitePool,
    events: &EventBus,
    link_id: Uuid,
    req: ReplanRequest,
) -> Result<ReplanOutcome> {
    let link = registry::get_link(pool, link_id).await?;
    if link.replan_state != ReplanState::Flagged {
        return Err(Error::Validation(
            "link is not flagged for replanning".to_string(),
        ));
    }

    let basis = datapoints::get_point(pool, req.basis_actual_id).await?;
    if basis.link_id != link_id {
        return Err(Error::Validation(
            "basis actual does not belong to this link".to_string(),
        ));
    }
    if basis.actual_subtype().is_none() {
        return Err(Error::Validation("basis data point is not an actual".to_string()));
    }
    let basis_date = basis.effective_date;

    let policy = ReplanPolicy::load_for_link(pool, &link).await;

    // Full Expected series with row ids; the future window starts at the
    // basis date
    let rows = sqlx::query_as::<_, (String, String, f64)>(
        "SELECT id, effective_date, value FROM measure_data_points
         WHERE link_id = ? AND category = 'target' AND subtype = 'expected'
         ORDER BY effective_date ASC",
    )
    .bind(link_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut full_series: Vec<SeriesPoint> = Vec::with_capacity(rows.len());
    let mut future: Vec<(Uuid, SeriesPoint)> = Vec::new();
    for (id, date, value) in &rows {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| Error::Internal(format!("invalid date '{}': {}", date, e)))?;
        full_series.push((date, *value));
        if date >= basis_date {
            let id = Uuid::parse_str(id)
                .map_err(|e| Error::Internal(format!("invalid uuid '{}': {}", id, e)))?;
            future.push((id, (date, *value)));
        }
    }

    if future.is_empty() {
        return Err(Error::Validation(
            "no future Expected targets to adjust".to_string(),
        ));
    }

    let points_before: Vec<CustomPoint> = future
        .iter()
        .map(|(_, (date, value))| CustomPoint {
            effective_date: *date,
            value: *value,
        })
        .collect();
    let future_series: Vec<SeriesPoint> = future.iter().map(|(_, p)| *p).collect();

    let points_after: Vec<CustomPoint> = match req.strategy {
        AdjustmentStrategy::MaintainFinalGoal => {
            maintain_final_goal(&future_series, (basis_date, basis.value), policy.method)?
                .into_iter()
                .map(|(effective_date, value)| CustomPoint { effective_date, value })
                .collect()
        }
        AdjustmentStrategy::ProportionalShift => {
            let expected_at_basis = policy
                .method
                .expected_value_at(&full_series, basis_date)
                .ok_or_else(|| {
                    Error::Validation(
                        "no expected value at the basis actual's date".to_string(),
                    )
                })?;
            let delta = basis.value - expected_at_basis;
            proportional_shift(&future_series, delta)
                .into_iter()
                .map(|(effective_date, value)| CustomPoint { effective_date, value })
                .collect()
        }
        AdjustmentStrategy::Custom => {
            let points = req.points.clone().ok_or_else(|| {
                Error::Validation("custom strategy requires a replacement series".to_string())
            })?;
            validate_custom_points(&points, basis_date)?;
            points
        }
    };

    let adjustment_id = uuid_utils::generate();
    let mut tx = pool.begin().await?;

    match req.strategy {
        AdjustmentStrategy::Custom => {
            // Replace the future window wholesale
            sqlx::query(
                "DELETE FROM measure_data_points
                 WHERE link_id = ? AND category = 'target' AND subtype = 'expected'
                   AND effective_date >= ?",
            )
            .bind(link_id.to_string())
            .bind(basis_date.to_string())
            .execute(&mut *tx)
            .await?;

            for point in &points_after {
                sqlx::query(
                    "INSERT INTO measure_data_points
                     (id, link_id, category, subtype, value, effective_date, recorded_by, recorded_at)
                     VALUES (?, ?, 'target', 'expected', ?, ?, ?, ?)",
                )
                .bind(uuid_utils::generate().to_string())
                .bind(link_id.to_string())
                .bind(point.value)
                .bind(point.effective_date.to_string())
                .bind(&req.adjusted_by)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::conflict_on_unique(e, "replacement series contains a duplicate date")
                })?;
            }
        }
        _ => {
            // In-place value rewrite; dates and ids are preserved
            for ((id, _), point) in future.iter().zip(points_after.iter()) {
                sqlx::query(
                    "UPDATE measure_data_points
                     SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
                )
                .bind(point.value)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            }
        }
    }

    sqlx::query(
        "INSERT INTO replan_adjustments
         (id, link_id, strategy, triggered_by, points_before, points_after, reason, adjusted_by)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(adjustment_id.to_string())
    .bind(link_id.to_string())
    .bind(req.strategy.as_db_string())
    .bind(req.basis_actual_id.to_string())
    .bind(serde_json::to_string(&points_before).map_err(|e| Error::Internal(e.to_string()))?)
    .bind(serde_json::to_string(&points_after).map_err(|e| Error::Internal(e.to_string()))?)
    .bind(&req.reason)
    .bind(&req.adjusted_by)
    .execute(&mut *tx)
    .await?;

    // Breach bookkeeping described the old plan; start a fresh streak
    sqlx::query(
        "UPDATE measure_data_points SET breach = 0
         WHERE link_id = ? AND category = 'actual' AND breach = 1",
    )
    .bind(link_id.to_string())
    .execute(&mut *tx)
    .await?;

    registry::set_replan_state(&mut tx, link_id, ReplanState::Normal).await?;
    tx.commit().await?;

    info!(
        "Replanned link {} with {} ({} points)",
        link_id,
        req.strategy.as_db_string(),
        points_after.len()
    );
    events.emit_lossy(EngineEvent::TargetsReplanned {
        link_id,
        strategy: req.strategy.as_db_string().to_string(),
        basis_actual_id: req.basis_actual_id,
        points_changed: points_after.len(),
        timestamp: Utc::now(),
    });

    Ok(ReplanOutcome {
        adjustment_id,
        strategy: req.strategy,
        points_before,
        points_after,
    })
}

/// Acknowledge a flag without changing targets
pub async fn dismiss(pool: &SqlitePool, events: &EventBus, link_id: Uuid) -> Result<MeasureLink> {
    let link = registry::get_link(pool, link_id).await?;
    if link.replan_state != ReplanState::Flagged {
        return Err(Error::Validation(
            "link is not flagged for replanning".to_string(),
        ));
    }

    let mut conn = pool.acquire().await?;
    registry::set_replan_state(&mut conn, link_id, ReplanState::Dismissed).await?;
    drop(conn);

    events.emit_lossy(EngineEvent::ReplanDismissed {
        link_id,
        timestamp: Utc::now(),
    });

    registry::get_link(pool, link_id).await
}

/// Keep the final Expected point; redistribute intermediate points so
/// the trajectory reconnects the basis actual to the unchanged final
/// target along the given interpolation shape
pub fn maintain_final_goal(
    future: &[SeriesPoint],
    basis: SeriesPoint,
    method: InterpolationMethod,
) -> Result<Vec<SeriesPoint>> {
    let (final_date, final_value) = *future
        .last()
        .ok_or_else(|| Error::Validation("no future Expected targets to adjust".to_string()))?;

    if final_date <= basis.0 {
        return Err(Error::Validation(
            "final Expected target must be dated after the basis actual".to_string(),
        ));
    }

    future
        .iter()
        .map(|(date, value)| {
            if *date == final_date {
                return Ok((*date, *value));
            }
            let reconnected = method
                .reconnect_value_at(basis, (final_date, final_value), *date)
                .ok_or_else(|| {
                    Error::Validation(
                        "reconnect trajectory is undefined for this interpolation method"
                            .to_string(),
                    )
                })?;
            Ok((*date, reconnected))
        })
        .collect()
}

/// Shift every future point by the same absolute delta
pub fn proportional_shift(future: &[SeriesPoint], delta: f64) -> Vec<SeriesPoint> {
    future.iter().map(|(date, value)| (*date, value + delta)).collect()
}

/// Validate a caller-supplied replacement series
pub fn validate_custom_points(points: &[CustomPoint], basis_date: NaiveDate) -> Result<()> {
    if points.is_empty() {
        return Err(Error::Validation(
            "replacement series must contain at least one point".to_string(),
        ));
    }
    let mut prev: Option<NaiveDate> = None;
    for point in points {
        if !point.value.is_finite() {
            return Err(Error::Validation("replacement values must be finite".to_string()));
        }
        if point.effective_date < basis_date {
            return Err(Error::Validation(
                "replacement points must not predate the basis actual".to_string(),
            ));
        }
        if let Some(prev) = prev {
            if point.effective_date <= prev {
                return Err(Error::Validation(
                    "replacement dates must be strictly increasing".to_string(),
                ));
            }
        }
        prev = Some(point.effective_date);
    }
    Ok(())
}
