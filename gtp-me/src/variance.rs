//! Variance calculation service
//!
//! Pure functions, no side effects. Variance numbers are
//! direction-agnostic: `variance = actual - expected` regardless of
//! whether the measure improves upward or downward. Direction only
//! matters to the thin classification layer (`track_status`), never to
//! the arithmetic. An undefined expected value or a zero denominator
//! yields `None`, which callers must treat as "insufficient data".

use chrono::NaiveDate;
use gtp_common::db::models::{ActualSubtype, DataPoint};
use gtp_common::interpolate::{InterpolationMethod, SeriesPoint};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of comparing an actual reading to the Expected trajectory
///
/// Never persisted - always derived, so stored data stays consistent
/// when replanning changes the Expected series retroactively.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VarianceResult {
    pub expected: Option<f64>,
    pub variance: Option<f64>,
    pub variance_pct: Option<f64>,
}

/// variance = actual - expected; variance_pct = variance / expected x 100
///
/// Both are `None` when `expected` is `None`; the percentage alone is
/// `None` when `expected` is zero.
pub fn compute_variance(actual: f64, expected: Option<f64>) -> VarianceResult {
    match expected {
        None => VarianceResult {
            expected: None,
            variance: None,
            variance_pct: None,
        },
        Some(e) => {
            let variance = actual - e;
            let variance_pct = if e == 0.0 {
                None
            } else {
                Some(variance / e * 100.0)
            };
            VarianceResult {
                expected: Some(e),
                variance: Some(variance),
                variance_pct,
            }
        }
    }
}

/// Which way the measure improves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Positive variance is favorable (revenue, adoption)
    Up,
    /// Negative variance is favorable (defect count, cost)
    Down,
}

impl Direction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            _ => None,
        }
    }
}

/// Classification of a variance number under a direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Favorability {
    Favorable,
    Unfavorable,
    Neutral,
}

/// Classify a raw variance under the measure's direction
///
/// The variance itself is untouched; only the reading of its sign flips.
pub fn classify(variance: f64, direction: Direction) -> Favorability {
    if variance == 0.0 {
        return Favorability::Neutral;
    }
    let favorable = match direction {
        Direction::Up => variance > 0.0,
        Direction::Down => variance < 0.0,
    };
    if favorable {
        Favorability::Favorable
    } else {
        Favorability::Unfavorable
    }
}

/// Whether a single reading breaches the threshold
///
/// An undefined variance percentage never breaches.
pub fn is_breach(variance_pct: Option<f64>, threshold_pct: f64) -> bool {
    variance_pct.map(|p| p.abs() > threshold_pct).unwrap_or(false)
}

/// Replan suggestion check
///
/// True when this reading breaches AND the breach has now held for
/// `required_count` consecutive actual recordings.
/// `prior_consecutive_misses` is the breach streak before this reading;
/// a single out-of-band reading never triggers on its own when
/// `required_count` > 1.
pub fn should_suggest_replan(
    variance_pct: Option<f64>,
    threshold_pct: f64,
    prior_consecutive_misses: u32,
    required_count: u32,
) -> bool {
    is_breach(variance_pct, threshold_pct) && prior_consecutive_misses + 1 >= required_count
}

/// Authoritative actual per effective date
///
/// When an Estimate and a Measured reading exist for the same date, the
/// Measured one is used for all downstream calculation. Non-actual
/// points are ignored. Returned sorted by date ascending.
pub fn authoritative_actuals(points: &[DataPoint]) -> Vec<&DataPoint> {
    let mut by_date: BTreeMap<NaiveDate, &DataPoint> = BTreeMap::new();
    for point in points {
        let subtype = match point.actual_subtype() {
            Some(s) => s,
            None => continue,
        };
        let existing_measured = by_date
            .get(&point.effective_date)
            .map(|p| p.actual_subtype() == Some(ActualSubtype::Measured))
            .unwrap_or(false);
        if existing_measured {
            continue;
        }
        if subtype == ActualSubtype::Measured || !by_date.contains_key(&point.effective_date) {
            by_date.insert(point.effective_date, point);
        }
    }
    by_date.into_values().collect()
}

/// Length of the trailing breach streak over the authoritative actuals,
/// newest reading first
pub fn trailing_breaches(points: &[DataPoint]) -> u32 {
    authoritative_actuals(points)
        .iter()
        .rev()
        .take_while(|p| p.breached())
        .count() as u32
}

/// Qualitative status for the planning read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    OnTrack,
    Ahead,
    Behind,
    Unknown,
}

/// Derive a qualitative status from the current variance
///
/// Within the threshold band the link is on track; outside it the
/// direction decides whether the deviation is ahead or behind. An
/// undefined variance is unknown, never on track.
pub fn track_status(
    variance_pct: Option<f64>,
    threshold_pct: f64,
    direction: Direction,
) -> TrackStatus {
    match variance_pct {
        None => TrackStatus::Unknown,
        Some(p) if p.abs() <= threshold_pct => TrackStatus::OnTrack,
        Some(p) => match classify(p, direction) {
            Favorability::Favorable => TrackStatus::Ahead,
            _ => TrackStatus::Behind,
        },
    }
}

/// Computed summary for the planning read
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub latest_actual_date: Option<NaiveDate>,
    pub latest_actual_value: Option<f64>,
    pub current_expected: Option<f64>,
    pub variance: Option<f64>,
    pub variance_pct: Option<f64>,
    pub status: TrackStatus,
}

/// Summarize a link's plan: latest authoritative actual vs the Expected
/// trajectory at that date
pub fn summarize(
    expected_series: &[SeriesPoint],
    actuals: &[DataPoint],
    method: InterpolationMethod,
    threshold_pct: f64,
    direction: Direction,
) -> PlanSummary {
    let authoritative = authoritative_actuals(actuals);
    let latest = authoritative.last();

    match latest {
        None => PlanSummary {
            latest_actual_date: None,
            latest_actual_value: None,
            current_expected: None,
            variance: None,
            variance_pct: None,
            status: TrackStatus::Unknown,
        },
        Some(actual) => {
            let expected = method.expected_value_at(expected_series, actual.effective_date);
            let result = compute_variance(actual.value, expected);
            PlanSummary {
                latest_actual_date: Some(actual.effective_date),
                latest_actual_value: Some(actual.value),
                current_expected: result.expected,
                variance: result.variance,
                variance_pct: result.variance_pct,
                status: track_status(result.variance_pct, threshold_pct, direction),
            }
        }
    }
}
