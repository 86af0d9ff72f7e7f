//! Database models
//!
//! Row structs mirror the wide storage schema; domain structs carry a
//! tagged `PointKind` union so target-only fields (confidence, rationale)
//! and actual-only fields (source, override bookkeeping, breach flag)
//! cannot be combined incorrectly. Links hold plain foreign-key ids, not
//! embedded entity records - measure/person/goal/strategy records belong
//! to the platform CRUD layer.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Data point category; fixed at creation, never converted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataPointCategory {
    Target,
    Actual,
}

impl DataPointCategory {
    pub fn as_db_string(&self) -> &'static str {
        match self {
            DataPointCategory::Target => "target",
            DataPointCategory::Actual => "actual",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "target" => Some(DataPointCategory::Target),
            "actual" => Some(DataPointCategory::Actual),
            _ => None,
        }
    }
}

/// Target subtype: three parallel planned trajectories
///
/// Only `Expected` drives expected-value interpolation; `Optimal` and
/// `Minimal` are independent comparison lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSubtype {
    Expected,
    Optimal,
    Minimal,
}

impl TargetSubtype {
    pub fn as_db_string(&self) -> &'static str {
        match self {
            TargetSubtype::Expected => "expected",
            TargetSubtype::Optimal => "optimal",
            TargetSubtype::Minimal => "minimal",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "expected" => Some(TargetSubtype::Expected),
            "optimal" => Some(TargetSubtype::Optimal),
            "minimal" => Some(TargetSubtype::Minimal),
            _ => None,
        }
    }
}

/// Actual subtype: dual-confidence readings
///
/// When both exist for the same date, `Measured` is authoritative for all
/// downstream calculation; `Estimate` is retained for history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActualSubtype {
    Estimate,
    Measured,
}

impl ActualSubtype {
    pub fn as_db_string(&self) -> &'static str {
        match self {
            ActualSubtype::Estimate => "estimate",
            ActualSubtype::Measured => "measured",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "estimate" => Some(ActualSubtype::Estimate),
            "measured" => Some(ActualSubtype::Measured),
            _ => None,
        }
    }
}

/// Per-link replanning state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplanState {
    Normal,
    Flagged,
    Dismissed,
}

impl ReplanState {
    pub fn as_db_string(&self) -> &'static str {
        match self {
            ReplanState::Normal => "normal",
            ReplanState::Flagged => "flagged",
            ReplanState::Dismissed => "dismissed",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(ReplanState::Normal),
            "flagged" => Some(ReplanState::Flagged),
            "dismissed" => Some(ReplanState::Dismissed),
            _ => None,
        }
    }
}

/// Association between a measure, a responsible person, and an optional
/// goal/strategy context
#[derive(Debug, Clone, Serialize)]
pub struct MeasureLink {
    pub id: Uuid,
    pub tenant_id: String,
    pub measure_id: Uuid,
    pub person_id: Uuid,
    pub goal_id: Option<Uuid>,
    pub strategy_id: Option<Uuid>,
    pub threshold_pct: Option<f64>,
    pub link_type: Option<String>,
    pub weight: Option<f64>,
    pub display_order: i64,
    pub is_primary: bool,
    pub replan_state: ReplanState,
    pub linked_at: DateTime<Utc>,
    pub linked_by: Option<String>,
}

impl MeasureLink {
    /// Personal scorecard link: no goal or strategy context
    pub fn is_personal(&self) -> bool {
        self.goal_id.is_none() && self.strategy_id.is_none()
    }
}

/// Override bookkeeping for manually corrected actuals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideInfo {
    pub original_value: f64,
    pub comment: Option<String>,
}

/// Category-specific data point fields
///
/// Tagged union: a target cannot carry a source or an override, an actual
/// cannot carry confidence or rationale.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum PointKind {
    Target {
        subtype: TargetSubtype,
        label: Option<String>,
        confidence: Option<u8>,
        rationale: Option<String>,
    },
    Actual {
        subtype: ActualSubtype,
        source: Option<String>,
        override_info: Option<OverrideInfo>,
        breach: bool,
    },
}

/// A single target or actual value attached to a link
#[derive(Debug, Clone, Serialize)]
pub struct DataPoint {
    pub id: Uuid,
    pub link_id: Uuid,
    pub value: f64,
    pub effective_date: NaiveDate,
    pub period_start: Option<NaiveDate>,
    #[serde(flatten)]
    pub kind: PointKind,
    pub recorded_by: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DataPoint {
    pub fn category(&self) -> DataPointCategory {
        match self.kind {
            PointKind::Target { .. } => DataPointCategory::Target,
            PointKind::Actual { .. } => DataPointCategory::Actual,
        }
    }

    pub fn actual_subtype(&self) -> Option<ActualSubtype> {
        match &self.kind {
            PointKind::Actual { subtype, .. } => Some(*subtype),
            PointKind::Target { .. } => None,
        }
    }

    pub fn target_subtype(&self) -> Option<TargetSubtype> {
        match &self.kind {
            PointKind::Target { subtype, .. } => Some(*subtype),
            PointKind::Actual { .. } => None,
        }
    }

    pub fn breached(&self) -> bool {
        matches!(self.kind, PointKind::Actual { breach: true, .. })
    }
}

/// Raw measure_links row
#[derive(Debug, Clone, FromRow)]
pub struct LinkRow {
    pub id: String,
    pub tenant_id: String,
    pub measure_id: String,
    pub person_id: String,
    pub goal_id: Option<String>,
    pub strategy_id: Option<String>,
    pub threshold_pct: Option<f64>,
    pub link_type: Option<String>,
    pub weight: Option<f64>,
    pub display_order: i64,
    pub is_primary: i64,
    pub replan_state: String,
    pub linked_at: String,
    pub linked_by: Option<String>,
}

impl TryFrom<LinkRow> for MeasureLink {
    type Error = Error;

    fn try_from(row: LinkRow) -> Result<Self> {
        Ok(MeasureLink {
            id: parse_uuid(&row.id)?,
            tenant_id: row.tenant_id,
            measure_id: parse_uuid(&row.measure_id)?,
            person_id: parse_uuid(&row.person_id)?,
            goal_id: row.goal_id.as_deref().map(parse_uuid).transpose()?,
            strategy_id: row.strategy_id.as_deref().map(parse_uuid).transpose()?,
            threshold_pct: row.threshold_pct,
            link_type: row.link_type,
            weight: row.weight,
            display_order: row.display_order,
            is_primary: row.is_primary != 0,
            replan_state: ReplanState::from_db(&row.replan_state).ok_or_else(|| {
                Error::Internal(format!("invalid replan_state '{}'", row.replan_state))
            })?,
            linked_at: parse_timestamp(&row.linked_at)?,
            linked_by: row.linked_by,
        })
    }
}

/// Raw measure_data_points row (wide storage shape)
#[derive(Debug, Clone, FromRow)]
pub struct DataPointRow {
    pub id: String,
    pub link_id: String,
    pub category: String,
    pub subtype: String,
    pub value: f64,
    pub effective_date: String,
    pub period_start: Option<String>,
    pub label: Option<String>,
    pub confidence: Option<i64>,
    pub rationale: Option<String>,
    pub original_value: Option<f64>,
    pub manual_override: i64,
    pub override_comment: Option<String>,
    pub source: Option<String>,
    pub breach: i64,
    pub recorded_by: Option<String>,
    pub recorded_at: String,
}

impl TryFrom<DataPointRow> for DataPoint {
    type Error = Error;

    fn try_from(row: DataPointRow) -> Result<Self> {
        let category = DataPointCategory::from_db(&row.category)
            .ok_or_else(|| Error::Internal(format!("invalid category '{}'", row.category)))?;

        let kind = match category {
            DataPointCategory::Target => PointKind::Target {
                subtype: TargetSubtype::from_db(&row.subtype).ok_or_else(|| {
                    Error::Internal(format!("invalid target subtype '{}'", row.subtype))
                })?,
                label: row.label,
                confidence: row.confidence.map(|c| c as u8),
                rationale: row.rationale,
            },
            DataPointCategory::Actual => PointKind::Actual {
                subtype: ActualSubtype::from_db(&row.subtype).ok_or_else(|| {
                    Error::Internal(format!("invalid actual subtype '{}'", row.subtype))
                })?,
                source: row.source,
                override_info: match (row.manual_override != 0, row.original_value) {
                    (true, Some(original_value)) => Some(OverrideInfo {
                        original_value,
                        comment: row.override_comment,
                    }),
                    _ => None,
                },
                breach: row.breach != 0,
            },
        };

        Ok(DataPoint {
            id: parse_uuid(&row.id)?,
            link_id: parse_uuid(&row.link_id)?,
            value: row.value,
            effective_date: parse_date(&row.effective_date)?,
            period_start: row.period_start.as_deref().map(parse_date).transpose()?,
            kind,
            recorded_by: row.recorded_by,
            recorded_at: parse_timestamp(&row.recorded_at)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("invalid uuid '{}': {}", s, e)))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::Internal(format!("invalid date '{}': {}", s, e)))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("invalid timestamp '{}': {}", s, e)))
}
