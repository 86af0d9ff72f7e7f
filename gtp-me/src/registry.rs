//! Link Registry
//!
//! Owns the association between a Measure, a responsible Person, and an
//! optional Goal/Strategy context. Structural rules are validated up
//! front; uniqueness (goal-level, strategy-level, single primary per
//! goal) is enforced by the partial unique indexes created in
//! gtp-common::db::init, so a check-then-insert race loses at the
//! storage layer and surfaces as `Conflict`. Primary swaps run inside a
//! single transaction.

use chrono::Utc;
use gtp_common::db::models::{LinkRow, MeasureLink, ReplanState};
use gtp_common::events::{EngineEvent, EventBus};
use gtp_common::uuid_utils;
use gtp_common::{Error, Result};
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

/// Request to create a measure link
#[derive(Debug, Clone, Deserialize)]
pub struct NewLink {
    pub tenant_id: String,
    pub measure_id: Uuid,
    pub person_id: Uuid,
    #[serde(default)]
    pub goal_id: Option<Uuid>,
    #[serde(default)]
    pub strategy_id: Option<Uuid>,
    #[serde(default)]
    pub threshold_pct: Option<f64>,
    #[serde(default)]
    pub link_type: Option<String>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub display_order: Option<i64>,
    #[serde(default)]
    pub linked_by: Option<String>,
}

/// Partial metadata update; absent fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataPatch {
    #[serde(default)]
    pub threshold_pct: Option<f64>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub display_order: Option<i64>,
    #[serde(default)]
    pub link_type: Option<String>,
    #[serde(default)]
    pub person_id: Option<Uuid>,
}

/// List filter; `personal_only` selects links with no goal or strategy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkFilter {
    #[serde(default)]
    pub measure_id: Option<Uuid>,
    #[serde(default)]
    pub goal_id: Option<Uuid>,
    #[serde(default)]
    pub strategy_id: Option<Uuid>,
    #[serde(default)]
    pub person_id: Option<Uuid>,
    #[serde(default)]
    pub personal_only: bool,
}

/// Create a link, auto-promoting it to primary when it is the first
/// link for its goal
pub async fn create_link(pool: &SqlitePool, events: &EventBus, req: NewLink) -> Result<MeasureLink> {
    if req.strategy_id.is_some() && req.goal_id.is_none() {
        return Err(Error::Validation(
            "a strategy-level link requires a goal".to_string(),
        ));
    }
    validate_threshold(req.threshold_pct)?;
    validate_weight(req.weight)?;

    let id = uuid_utils::generate();
    let linked_at = Utc::now().to_rfc3339();

    let mut tx = pool.begin().await?;

    // First link for a goal becomes primary. A concurrent racer is
    // caught by the single-primary unique index and rejected.
    let is_primary = match req.goal_id {
        Some(goal_id) => {
            let existing: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM measure_links WHERE goal_id = ?")
                    .bind(goal_id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
            existing == 0
        }
        None => false,
    };

    sqlx::query(
        r#"
        INSERT INTO measure_links
        (id, tenant_id, measure_id, person_id, goal_id, strategy_id,
         threshold_pct, link_type, weight, display_order, is_primary,
         replan_state, linked_at, linked_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'normal', ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(&req.tenant_id)
    .bind(req.measure_id.to_string())
    .bind(req.person_id.to_string())
    .bind(req.goal_id.map(|g| g.to_string()))
    .bind(req.strategy_id.map(|s| s.to_string()))
    .bind(req.threshold_pct)
    .bind(&req.link_type)
    .bind(req.weight)
    .bind(req.display_order.unwrap_or(0))
    .bind(is_primary as i64)
    .bind(&linked_at)
    .bind(&req.linked_by)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        Error::conflict_on_unique(
            e,
            "measure is already linked at this goal/strategy level",
        )
    })?;

    let link = fetch_link_tx(&mut tx, id).await?;
    tx.commit().await?;

    info!("Created link {} for measure {}", id, req.measure_id);
    events.emit_lossy(EngineEvent::LinkCreated {
        link_id: link.id,
        measure_id: link.measure_id,
        person_id: link.person_id,
        goal_id: link.goal_id,
        strategy_id: link.strategy_id,
        is_primary: link.is_primary,
        timestamp: Utc::now(),
    });

    Ok(link)
}

/// Load a link by id
pub async fn get_link(pool: &SqlitePool, link_id: Uuid) -> Result<MeasureLink> {
    let row = sqlx::query_as::<_, LinkRow>("SELECT * FROM measure_links WHERE id = ?")
        .bind(link_id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("link {}", link_id)))?;

    MeasureLink::try_from(row)
}

/// List links matching the filter, ordered by display order
pub async fn list_links(pool: &SqlitePool, filter: &LinkFilter) -> Result<Vec<MeasureLink>> {
    let mut sql = String::from("SELECT * FROM measure_links WHERE 1=1");
    if filter.measure_id.is_some() {
        sql.push_str(" AND measure_id = ?");
    }
    if filter.goal_id.is_some() {
        sql.push_str(" AND goal_id = ?");
    }
    if filter.strategy_id.is_some() {
        sql.push_str(" AND strategy_id = ?");
    }
    if filter.person_id.is_some() {
        sql.push_str(" AND person_id = ?");
    }
    if filter.personal_only {
        sql.push_str(" AND goal_id IS NULL AND strategy_id IS NULL");
    }
    sql.push_str(" ORDER BY display_order ASC, linked_at ASC");

    let mut query = sqlx::query_as::<_, LinkRow>(&sql);
    if let Some(measure_id) = filter.measure_id {
        query = query.bind(measure_id.to_string());
    }
    if let Some(goal_id) = filter.goal_id {
        query = query.bind(goal_id.to_string());
    }
    if let Some(strategy_id) = filter.strategy_id {
        query = query.bind(strategy_id.to_string());
    }
    if let Some(person_id) = filter.person_id {
        query = query.bind(person_id.to_string());
    }

    let rows = query.fetch_all(pool).await?;
    rows.into_iter().map(MeasureLink::try_from).collect()
}

/// Remove a link and (by cascade) its data points
///
/// A primary link with siblings on the same goal cannot be unlinked
/// without naming a replacement primary; the replacement must be linked
/// to the same goal. Removal and promotion commit as one unit.
pub async fn unlink(
    pool: &SqlitePool,
    events: &EventBus,
    link_id: Uuid,
    new_primary: Option<Uuid>,
) -> Result<()> {
    let link = get_link(pool, link_id).await?;

    let mut promoted: Option<MeasureLink> = None;
    if link.is_primary {
        if let Some(goal_id) = link.goal_id {
            let siblings: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM measure_links WHERE goal_id = ? AND id != ?",
            )
            .bind(goal_id.to_string())
            .bind(link_id.to_string())
            .fetch_one(pool)
            .await?;

            if siblings > 0 {
                let replacement_id = new_primary.ok_or_else(|| {
                    Error::Validation(
                        "cannot unlink the primary link while other links exist for its goal; \
                         supply a replacement primary"
                            .to_string(),
                    )
                })?;
                let replacement = get_link(pool, replacement_id).await.map_err(|e| match e {
                    Error::NotFound(_) => Error::Validation(
                        "replacement primary link does not exist".to_string(),
                    ),
                    other => other,
                })?;
                if replacement.goal_id != Some(goal_id) || replacement.id == link.id {
                    return Err(Error::Validation(
                        "replacement primary must be another link of the same goal".to_string(),
                    ));
                }
                promoted = Some(replacement);
            }
        }
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM measure_links WHERE id = ?")
        .bind(link_id.to_string())
        .execute(&mut *tx)
        .await?;
    if let Some(ref replacement) = promoted {
        sqlx::query(
            "UPDATE measure_links SET is_primary = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(replacement.id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::conflict_on_unique(e, "goal already has a primary link"))?;
    }
    tx.commit().await?;

    info!("Removed link {}", link_id);
    events.emit_lossy(EngineEvent::LinkRemoved {
        link_id,
        measure_id: link.measure_id,
        goal_id: link.goal_id,
        timestamp: Utc::now(),
    });
    if let (Some(replacement), Some(goal_id)) = (promoted, link.goal_id) {
        events.emit_lossy(EngineEvent::PrimaryChanged {
            goal_id,
            old_link_id: Some(link_id),
            new_link_id: replacement.id,
            timestamp: Utc::now(),
        });
    }

    Ok(())
}

/// Atomically demote the current primary for a goal and promote the
/// target link
pub async fn set_primary(
    pool: &SqlitePool,
    events: &EventBus,
    link_id: Uuid,
    goal_id: Uuid,
) -> Result<MeasureLink> {
    let link = get_link(pool, link_id).await?;
    if link.goal_id != Some(goal_id) {
        return Err(Error::Validation(
            "link is not attached to the given goal".to_string(),
        ));
    }

    let mut tx = pool.begin().await?;

    let old_primary: Option<String> = sqlx::query_scalar(
        "SELECT id FROM measure_links WHERE goal_id = ? AND is_primary = 1",
    )
    .bind(goal_id.to_string())
    .fetch_optional(&mut *tx)
    .await?;

    // Demote before promote; the single-primary index checks per
    // statement, so ordering matters inside the transaction.
    sqlx::query(
        "UPDATE measure_links SET is_primary = 0, updated_at = CURRENT_TIMESTAMP
         WHERE goal_id = ? AND is_primary = 1",
    )
    .bind(goal_id.to_string())
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE measure_links SET is_primary = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(link_id.to_string())
    .execute(&mut *tx)
    .await
    .map_err(|e| Error::conflict_on_unique(e, "goal already has a primary link"))?;

    let updated = fetch_link_tx(&mut tx, link_id).await?;
    tx.commit().await?;

    let old_link_id = old_primary
        .filter(|id| id != &link_id.to_string())
        .and_then(|id| Uuid::parse_str(&id).ok());
    info!("Primary for goal {} set to link {}", goal_id, link_id);
    events.emit_lossy(EngineEvent::PrimaryChanged {
        goal_id,
        old_link_id,
        new_link_id: link_id,
        timestamp: Utc::now(),
    });

    Ok(updated)
}

/// Partial update of link metadata with range re-validation
pub async fn update_metadata(
    pool: &SqlitePool,
    link_id: Uuid,
    patch: MetadataPatch,
) -> Result<MeasureLink> {
    let link = get_link(pool, link_id).await?;

    let threshold_pct = patch.threshold_pct.or(link.threshold_pct);
    let weight = patch.weight.or(link.weight);
    let display_order = patch.display_order.unwrap_or(link.display_order);
    let link_type = patch.link_type.or(link.link_type);
    let person_id = patch.person_id.unwrap_or(link.person_id);

    validate_threshold(threshold_pct)?;
    validate_weight(weight)?;

    sqlx::query(
        r#"
        UPDATE measure_links
        SET threshold_pct = ?, weight = ?, display_order = ?, link_type = ?,
            person_id = ?, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(threshold_pct)
    .bind(weight)
    .bind(display_order)
    .bind(&link_type)
    .bind(person_id.to_string())
    .bind(link_id.to_string())
    .execute(pool)
    .await?;

    get_link(pool, link_id).await
}

/// Set the link's replan state (used by the replan engine)
pub(crate) async fn set_replan_state(
    executor: &mut sqlx::SqliteConnection,
    link_id: Uuid,
    state: ReplanState,
) -> Result<()> {
    sqlx::query(
        "UPDATE measure_links SET replan_state = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(state.as_db_string())
    .bind(link_id.to_string())
    .execute(executor)
    .await?;
    Ok(())
}

async fn fetch_link_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    link_id: Uuid,
) -> Result<MeasureLink> {
    let row = sqlx::query_as::<_, LinkRow>("SELECT * FROM measure_links WHERE id = ?")
        .bind(link_id.to_string())
        .fetch_one(&mut **tx)
        .await?;
    MeasureLink::try_from(row)
}

fn validate_threshold(threshold_pct: Option<f64>) -> Result<()> {
    if let Some(t) = threshold_pct {
        if !t.is_finite() || !(0.0..=100.0).contains(&t) {
            return Err(Error::Validation(format!(
                "threshold percentage must be between 0 and 100, got {}",
                t
            )));
        }
    }
    Ok(())
}

fn validate_weight(weight: Option<f64>) -> Result<()> {
    if let Some(w) = weight {
        if !w.is_finite() || !(0.0..=1.0).contains(&w) {
            return Err(Error::Validation(format!(
                "weight must be between 0.0 and 1.0, got {}",
                w
            )));
        }
    }
    Ok(())
}
