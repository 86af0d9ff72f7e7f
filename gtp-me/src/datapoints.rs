//! Data Point Store
//!
//! Owns target and actual data points attached to a link. Category is
//! fixed at creation and data points are never deleted individually -
//! they are the auditable record of a plan or a measurement. Actual
//! corrections preserve the original value and flip the override flag
//! permanently. Batch target upsert is one transaction: a partial batch
//! is never observable.

use chrono::{NaiveDate, Utc};
use gtp_common::db::models::{
    ActualSubtype, DataPoint, DataPointCategory, DataPointRow, PointKind, ReplanState,
    TargetSubtype,
};
use gtp_common::events::{EngineEvent, EventBus};
use gtp_common::interpolate::SeriesPoint;
use gtp_common::uuid_utils;
use gtp_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::replan::ReplanPolicy;
use crate::variance::{self, VarianceResult};
use crate::registry;

/// Request to create a single target point
#[derive(Debug, Clone, Deserialize)]
pub struct NewTarget {
    pub subtype: TargetSubtype,
    pub value: f64,
    pub effective_date: NaiveDate,
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default)]
    pub recorded_by: Option<String>,
}

/// One item of a batch target upsert; with an id it updates in place,
/// without one it creates
#[derive(Debug, Clone, Deserialize)]
pub struct TargetUpsert {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub subtype: TargetSubtype,
    pub value: f64,
    pub effective_date: NaiveDate,
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Request to record an actual reading
#[derive(Debug, Clone, Deserialize)]
pub struct NewActual {
    pub subtype: ActualSubtype,
    pub value: f64,
    pub effective_date: NaiveDate,
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub recorded_by: Option<String>,
}

/// Outcome of recording an actual: the stored point plus the variance
/// computed against the current Expected series (derived, not persisted)
#[derive(Debug, Clone, Serialize)]
pub struct RecordedActual {
    pub point: DataPoint,
    pub variance: VarianceResult,
    /// Whether this recording transitioned the link to flagged
    pub replan_flagged: bool,
}

/// Create a single target point
pub async fn create_target(pool: &SqlitePool, link_id: Uuid, req: NewTarget) -> Result<DataPoint> {
    registry::get_link(pool, link_id).await?;
    validate_value(req.value)?;
    validate_confidence(req.confidence)?;

    let id = uuid_utils::generate();
    insert_target_row(
        pool,
        id,
        link_id,
        req.subtype,
        req.value,
        req.effective_date,
        req.period_start,
        &req.label,
        req.confidence,
        &req.rationale,
        &req.recorded_by,
    )
    .await?;

    get_point(pool, id).await
}

/// Batch upsert of target points, applied as one logical unit
///
/// Items carrying an id must reference an existing target of the same
/// link; any invalid item rolls back the entire batch.
pub async fn batch_upsert_targets(
    pool: &SqlitePool,
    link_id: Uuid,
    items: Vec<TargetUpsert>,
) -> Result<Vec<DataPoint>> {
    registry::get_link(pool, link_id).await?;
    if items.is_empty() {
        return Err(Error::Validation("batch upsert requires at least one item".to_string()));
    }
    for item in &items {
        validate_value(item.value)?;
        validate_confidence(item.confidence)?;
    }

    let mut tx = pool.begin().await?;
    let mut affected_ids = Vec::with_capacity(items.len());

    for item in items {
        match item.id {
            Some(point_id) => {
                let row = sqlx::query_as::<_, DataPointRow>(
                    "SELECT * FROM measure_data_points WHERE id = ?",
                )
                .bind(point_id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| Error::NotFound(format!("data point {}", point_id)))?;

                if row.link_id != link_id.to_string() {
                    return Err(Error::Validation(format!(
                        "data point {} does not belong to link {}",
                        point_id, link_id
                    )));
                }
                if row.category != "target" {
                    return Err(Error::Validation(format!(
                        "data point {} is not a target",
                        point_id
                    )));
                }

                sqlx::query(
                    r#"
                    UPDATE measure_data_points
                    SET subtype = ?, value = ?, effective_date = ?, period_start = ?,
                        label = ?, confidence = ?, rationale = ?, updated_at = CURRENT_TIMESTAMP
                    WHERE id = ?
                    "#,
                )
                .bind(item.subtype.as_db_string())
                .bind(item.value)
                .bind(item.effective_date.to_string())
                .bind(item.period_start.map(|d| d.to_string()))
                .bind(&item.label)
                .bind(item.confidence.map(|c| c as i64))
                .bind(&item.rationale)
                .bind(point_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::conflict_on_unique(e, "a target already exists for this subtype and date")
                })?;

                affected_ids.push(point_id);
            }
            None => {
                let id = uuid_utils::generate();
                sqlx::query(
                    r#"
                    INSERT INTO measure_data_points
                    (id, link_id, category, subtype, value, effective_date, period_start,
                     label, confidence, rationale, recorded_at)
                    VALUES (?, ?, 'target', ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id.to_string())
                .bind(link_id.to_string())
                .bind(item.subtype.as_db_string())
                .bind(item.value)
                .bind(item.effective_date.to_string())
                .bind(item.period_start.map(|d| d.to_string()))
                .bind(&item.label)
                .bind(item.confidence.map(|c| c as i64))
                .bind(&item.rationale)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::conflict_on_unique(e, "a target already exists for this subtype and date")
                })?;

                affected_ids.push(id);
            }
        }
    }

    tx.commit().await?;
    info!("Upserted {} target points for link {}", affected_ids.len(), link_id);

    let mut points = Vec::with_capacity(affected_ids.len());
    for id in affected_ids {
        points.push(get_point(pool, id).await?);
    }
    Ok(points)
}

/// Record an actual reading and return its variance against the current
/// Expected series
///
/// The breach flag is stored on the point; when the consecutive-breach
/// policy fires, the link transitions to flagged. A non-breaching
/// reading returns a dismissed link to normal (the acknowledged streak
/// is over).
pub async fn record_actual(
    pool: &SqlitePool,
    events: &EventBus,
    link_id: Uuid,
    req: NewActual,
) -> Result<RecordedActual> {
    let link = registry::get_link(pool, link_id).await?;
    validate_value(req.value)?;

    let policy = ReplanPolicy::load_for_link(pool, &link).await;
    let series = expected_series(pool, link_id).await?;
    let expected = policy.method.expected_value_at(&series, req.effective_date);
    let result = variance::compute_variance(req.value, expected);
    let breach = variance::is_breach(result.variance_pct, policy.threshold_pct);

    // Streak before this reading, for the consecutive-breach guard
    let prior_points = actual_points(pool, link_id).await?;
    let prior_streak = variance::trailing_breaches(&prior_points);

    let id = uuid_utils::generate();
    sqlx::query(
        r#"
        INSERT INTO measure_data_points
        (id, link_id, category, subtype, value, effective_date, period_start,
         source, breach, recorded_by, recorded_at)
        VALUES (?, ?, 'actual', ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(link_id.to_string())
    .bind(req.subtype.as_db_string())
    .bind(req.value)
    .bind(req.effective_date.to_string())
    .bind(req.period_start.map(|d| d.to_string()))
    .bind(&req.source)
    .bind(breach as i64)
    .bind(&req.recorded_by)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .map_err(|e| {
        Error::conflict_on_unique(
            e,
            "an actual reading already exists for this subtype and date; correct it instead",
        )
    })?;

    let mut replan_flagged = false;
    let suggest = variance::should_suggest_replan(
        result.variance_pct,
        policy.threshold_pct,
        prior_streak,
        policy.required_consecutive,
    );
    if suggest && link.replan_state == ReplanState::Normal {
        let mut conn = pool.acquire().await?;
        registry::set_replan_state(&mut conn, link_id, ReplanState::Flagged).await?;
        replan_flagged = true;
        info!(
            "Link {} flagged for replanning after {} consecutive breaches",
            link_id,
            prior_streak + 1
        );
        events.emit_lossy(EngineEvent::ReplanFlagged {
            link_id,
            consecutive_breaches: prior_streak + 1,
            threshold_pct: policy.threshold_pct,
            timestamp: Utc::now(),
        });
    } else if !breach && link.replan_state == ReplanState::Dismissed {
        let mut conn = pool.acquire().await?;
        registry::set_replan_state(&mut conn, link_id, ReplanState::Normal).await?;
    }

    let point = get_point(pool, id).await?;
    events.emit_lossy(EngineEvent::ActualRecorded {
        link_id,
        data_point_id: id,
        value: req.value,
        effective_date: req.effective_date,
        variance_pct: result.variance_pct,
        breach,
        timestamp: Utc::now(),
    });

    Ok(RecordedActual {
        point,
        variance: result,
        replan_flagged,
    })
}

/// Ordered series of data points for a link
///
/// Ordered by effective date ascending; optionally restricted to one
/// subtype and/or a date range.
pub async fn get_series(
    pool: &SqlitePool,
    link_id: Uuid,
    category: DataPointCategory,
    subtype: Option<&str>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<DataPoint>> {
    registry::get_link(pool, link_id).await?;

    if let Some(s) = subtype {
        let valid = match category {
            DataPointCategory::Target => TargetSubtype::from_db(s).is_some(),
            DataPointCategory::Actual => ActualSubtype::from_db(s).is_some(),
        };
        if !valid {
            return Err(Error::Validation(format!(
                "invalid subtype '{}' for category {}",
                s,
                category.as_db_string()
            )));
        }
    }

    let mut sql = String::from(
        "SELECT * FROM measure_data_points WHERE link_id = ? AND category = ?",
    );
    if subtype.is_some() {
        sql.push_str(" AND subtype = ?");
    }
    if from.is_some() {
        sql.push_str(" AND effective_date >= ?");
    }
    if to.is_some() {
        sql.push_str(" AND effective_date <= ?");
    }
    sql.push_str(" ORDER BY effective_date ASC, subtype ASC");

    let mut query = sqlx::query_as::<_, DataPointRow>(&sql)
        .bind(link_id.to_string())
        .bind(category.as_db_string());
    if let Some(s) = subtype {
        query = query.bind(s.to_string());
    }
    if let Some(f) = from {
        query = query.bind(f.to_string());
    }
    if let Some(t) = to {
        query = query.bind(t.to_string());
    }

    let rows = query.fetch_all(pool).await?;
    rows.into_iter().map(DataPoint::try_from).collect()
}

/// The Expected target line as (date, value) pairs, sorted ascending
pub async fn expected_series(pool: &SqlitePool, link_id: Uuid) -> Result<Vec<SeriesPoint>> {
    let rows = sqlx::query_as::<_, (String, f64)>(
        "SELECT effective_date, value FROM measure_data_points
         WHERE link_id = ? AND category = 'target' AND subtype = 'expected'
         ORDER BY effective_date ASC",
    )
    .bind(link_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(date, value)| {
            NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map(|d| (d, value))
                .map_err(|e| Error::Internal(format!("invalid date '{}': {}", date, e)))
        })
        .collect()
}

/// All actual points of a link, sorted by date ascending
pub async fn actual_points(pool: &SqlitePool, link_id: Uuid) -> Result<Vec<DataPoint>> {
    let rows = sqlx::query_as::<_, DataPointRow>(
        "SELECT * FROM measure_data_points
         WHERE link_id = ? AND category = 'actual'
         ORDER BY effective_date ASC",
    )
    .bind(link_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(DataPoint::try_from).collect()
}

/// Load a data point by id
pub async fn get_point(pool: &SqlitePool, id: Uuid) -> Result<DataPoint> {
    let row = sqlx::query_as::<_, DataPointRow>("SELECT * FROM measure_data_points WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("data point {}", id)))?;
    DataPoint::try_from(row)
}

/// Correct a target value in place
pub async fn update_target(
    pool: &SqlitePool,
    id: Uuid,
    value: f64,
    rationale: Option<String>,
) -> Result<DataPoint> {
    validate_value(value)?;
    let point = get_point(pool, id).await?;
    if point.category() != DataPointCategory::Target {
        return Err(Error::Validation(format!("data point {} is not a target", id)));
    }

    match rationale {
        Some(rationale) => {
            sqlx::query(
                "UPDATE measure_data_points
                 SET value = ?, rationale = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(value)
            .bind(rationale)
            .bind(id.to_string())
            .execute(pool)
            .await?;
        }
        None => {
            sqlx::query(
                "UPDATE measure_data_points
                 SET value = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(value)
            .bind(id.to_string())
            .execute(pool)
            .await?;
        }
    }

    get_point(pool, id).await
}

/// Correct an actual value
///
/// The first correction preserves the prior value as `original_value`
/// and flips the override flag permanently; every correction requires a
/// comment. The breach flag is recomputed against the current Expected
/// series so the replan bookkeeping tracks the corrected value.
pub async fn update_actual(
    pool: &SqlitePool,
    id: Uuid,
    value: f64,
    comment: &str,
) -> Result<DataPoint> {
    validate_value(value)?;
    if comment.trim().is_empty() {
        return Err(Error::Validation(
            "correcting an actual requires a comment".to_string(),
        ));
    }

    let point = get_point(pool, id).await?;
    let already_overridden = match &point.kind {
        PointKind::Actual { override_info, .. } => override_info.is_some(),
        PointKind::Target { .. } => {
            return Err(Error::Validation(format!("data point {} is not an actual", id)));
        }
    };

    let link = registry::get_link(pool, point.link_id).await?;
    let policy = ReplanPolicy::load_for_link(pool, &link).await;
    let series = expected_series(pool, point.link_id).await?;
    let expected = policy.method.expected_value_at(&series, point.effective_date);
    let result = variance::compute_variance(value, expected);
    let breach = variance::is_breach(result.variance_pct, policy.threshold_pct);

    if already_overridden {
        sqlx::query(
            "UPDATE measure_data_points
             SET value = ?, override_comment = ?, breach = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(value)
        .bind(comment)
        .bind(breach as i64)
        .bind(id.to_string())
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE measure_data_points
             SET original_value = value, manual_override = 1, value = ?, override_comment = ?,
                 breach = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(value)
        .bind(comment)
        .bind(breach as i64)
        .bind(id.to_string())
        .execute(pool)
        .await?;
    }

    get_point(pool, id).await
}

#[allow(clippy::too_many_arguments)]
async fn insert_target_row(
    pool: &SqlitePool,
    id: Uuid,
    link_id: Uuid,
    subtype: TargetSubtype,
    value: f64,
    effective_date: NaiveDate,
    period_start: Option<NaiveDate>,
    label: &Option<String>,
    confidence: Option<u8>,
    rationale: &Option<String>,
    recorded_by: &Option<String>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO measure_data_points
        (id, link_id, category, subtype, value, effective_date, period_start,
         label, confidence, rationale, recorded_by, recorded_at)
        VALUES (?, ?, 'target', ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(link_id.to_string())
    .bind(subtype.as_db_string())
    .bind(value)
    .bind(effective_date.to_string())
    .bind(period_start.map(|d| d.to_string()))
    .bind(label)
    .bind(confidence.map(|c| c as i64))
    .bind(rationale)
    .bind(recorded_by)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await
    .map_err(|e| {
        Error::conflict_on_unique(e, "a target already exists for this subtype and date")
    })?;
    Ok(())
}

fn validate_value(value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::Validation("value must be a finite number".to_string()));
    }
    Ok(())
}

fn validate_confidence(confidence: Option<u8>) -> Result<()> {
    if let Some(c) = confidence {
        if !(1..=5).contains(&c) {
            return Err(Error::Validation(format!(
                "confidence must be between 1 and 5, got {}",
                c
            )));
        }
    }
    Ok(())
}
