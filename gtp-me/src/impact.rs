//! Cross-Context Impact Aggregator
//!
//! One measure may be linked into several goals; this read-side
//! aggregation reports, per goal context, how hard the measure's
//! current variance lands there: weight x |variance %| mapped to
//! qualitative bands. No state of its own, nothing is mutated.

use gtp_common::db::settings::get_setting_or;
use gtp_common::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::alignment::AlignmentClient;
use crate::datapoints;
use crate::registry::{self, LinkFilter};
use crate::replan::ReplanPolicy;
use crate::variance;

/// Qualitative impact band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    High,
    Medium,
    Low,
    /// Variance is undefined (insufficient data)
    Unknown,
}

/// Per-goal impact of one measure link
#[derive(Debug, Clone, Serialize)]
pub struct ImpactRow {
    pub link_id: Uuid,
    pub goal_id: Uuid,
    pub strategy_id: Option<Uuid>,
    pub weight: Option<f64>,
    pub threshold_pct: Option<f64>,
    pub variance_pct: Option<f64>,
    pub impact_score: Option<f64>,
    pub impact_level: ImpactLevel,
    pub current_alignment: Option<f64>,
}

/// Map an impact score onto the configured bands
pub fn impact_level(score: Option<f64>, high_band: f64, medium_band: f64) -> ImpactLevel {
    match score {
        None => ImpactLevel::Unknown,
        Some(s) if s > high_band => ImpactLevel::High,
        Some(s) if s > medium_band => ImpactLevel::Medium,
        Some(_) => ImpactLevel::Low,
    }
}

/// Per-goal impact rows for a measure
pub async fn measure_impact(
    pool: &SqlitePool,
    alignment: &AlignmentClient,
    measure_id: Uuid,
) -> Result<Vec<ImpactRow>> {
    let high_band = get_setting_or(pool, "impact_high_band", 50.0).await;
    let medium_band = get_setting_or(pool, "impact_medium_band", 20.0).await;

    let filter = LinkFilter {
        measure_id: Some(measure_id),
        ..Default::default()
    };
    let links = registry::list_links(pool, &filter).await?;

    let mut alignment_cache: HashMap<Uuid, Option<f64>> = HashMap::new();
    let mut rows = Vec::new();

    for link in links {
        let goal_id = match link.goal_id {
            Some(goal_id) => goal_id,
            None => continue,
        };

        let policy = ReplanPolicy::load_for_link(pool, &link).await;
        let series = datapoints::expected_series(pool, link.id).await?;
        let actuals = datapoints::actual_points(pool, link.id).await?;
        let summary = variance::summarize(
            &series,
            &actuals,
            policy.method,
            policy.threshold_pct,
            variance::Direction::Up,
        );

        // Weightless links count at full weight
        let impact_score = summary
            .variance_pct
            .map(|pct| link.weight.unwrap_or(1.0) * pct.abs());

        let current_alignment = match alignment_cache.get(&goal_id) {
            Some(cached) => *cached,
            None => {
                let fetched = alignment.goal_alignment(goal_id).await;
                alignment_cache.insert(goal_id, fetched);
                fetched
            }
        };

        rows.push(ImpactRow {
            link_id: link.id,
            goal_id,
            strategy_id: link.strategy_id,
            weight: link.weight,
            threshold_pct: link.threshold_pct,
            variance_pct: summary.variance_pct,
            impact_score,
            impact_level: impact_level(impact_score, high_band, medium_band),
            current_alignment,
        });
    }

    Ok(rows)
}
