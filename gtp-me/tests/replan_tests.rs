//! Integration tests for the replan engine
//!
//! Covers the flagged-state gate, the three adjustment strategies, the
//! past-points-are-immutable rule, audit recording, and dismissal.

use chrono::NaiveDate;
use gtp_common::db::init::init_database;
use gtp_common::db::models::{ActualSubtype, ReplanState, TargetSubtype};
use gtp_common::events::EventBus;
use gtp_common::Error;
use gtp_me::datapoints::{self, NewActual, NewTarget};
use gtp_me::registry::{self, NewLink};
use gtp_me::replan::{self, AdjustmentStrategy, CustomPoint, ReplanRequest};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

async fn setup(tag: &str) -> (SqlitePool, Arc<EventBus>, PathBuf) {
    let db_path = PathBuf::from(format!(
        "/tmp/gtp-me-replan-{}-{}.db",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&db_path);
    let pool = init_database(&db_path).await.expect("init database");
    (pool, Arc::new(EventBus::new(16)), db_path)
}

/// Create a link with the three-point quarter plan
/// (Jan 1, 100) - (Mar 1, 300) - (Mar 31, 400) and record two breaching
/// actuals ending with 300 on Feb 15, which flags the link.
/// Returns (link_id, basis_actual_id).
async fn flagged_link(pool: &SqlitePool, events: &EventBus) -> (Uuid, Uuid) {
    let link_id = registry::create_link(
        pool,
        events,
        NewLink {
            tenant_id: "tenant-1".to_string(),
            measure_id: Uuid::new_v4(),
            person_id: Uuid::new_v4(),
            goal_id: Some(Uuid::new_v4()),
            strategy_id: None,
            threshold_pct: None,
            link_type: None,
            weight: None,
            display_order: None,
            linked_by: None,
        },
    )
    .await
    .unwrap()
    .id;

    for (value, date) in [(100.0, "2024-01-01"), (300.0, "2024-03-01"), (400.0, "2024-03-31")] {
        datapoints::create_target(
            pool,
            link_id,
            NewTarget {
                subtype: TargetSubtype::Expected,
                value,
                effective_date: d(date),
                period_start: None,
                label: None,
                confidence: None,
                rationale: None,
                recorded_by: None,
            },
        )
        .await
        .unwrap();
    }

    // Expected at Jan 31: 100 + 200 x (30/60) = 200 -> 250 breaches (25%)
    // Expected at Feb 15: 100 + 200 x (45/60) = 250 -> 300 breaches (20%)
    let mut basis = Uuid::nil();
    for (value, date) in [(250.0, "2024-01-31"), (300.0, "2024-02-15")] {
        let recorded = datapoints::record_actual(
            pool,
            events,
            link_id,
            NewActual {
                subtype: ActualSubtype::Measured,
                value,
                effective_date: d(date),
                period_start: None,
                source: None,
                recorded_by: None,
            },
        )
        .await
        .unwrap();
        basis = recorded.point.id;
    }

    let link = registry::get_link(pool, link_id).await.unwrap();
    assert_eq!(link.replan_state, ReplanState::Flagged);

    (link_id, basis)
}

async fn expected_values(pool: &SqlitePool, link_id: Uuid) -> Vec<(NaiveDate, f64)> {
    datapoints::expected_series(pool, link_id).await.unwrap()
}

#[tokio::test]
async fn test_adjustment_requires_flagged_state() {
    let (pool, events, db_path) = setup("gate").await;
    let link_id = registry::create_link(
        &pool,
        &events,
        NewLink {
            tenant_id: "tenant-1".to_string(),
            measure_id: Uuid::new_v4(),
            person_id: Uuid::new_v4(),
            goal_id: None,
            strategy_id: None,
            threshold_pct: None,
            link_type: None,
            weight: None,
            display_order: None,
            linked_by: None,
        },
    )
    .await
    .unwrap()
    .id;

    let result = replan::apply_adjustment(
        &pool,
        &events,
        link_id,
        ReplanRequest {
            strategy: AdjustmentStrategy::ProportionalShift,
            basis_actual_id: Uuid::new_v4(),
            reason: None,
            adjusted_by: None,
            points: None,
        },
    )
    .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_maintain_final_goal_reconnects_to_unchanged_final() {
    let (pool, events, db_path) = setup("maintain").await;
    let (link_id, basis) = flagged_link(&pool, &events).await;

    let outcome = replan::apply_adjustment(
        &pool,
        &events,
        link_id,
        ReplanRequest {
            strategy: AdjustmentStrategy::MaintainFinalGoal,
            basis_actual_id: basis,
            reason: Some("demand spike".to_string()),
            adjusted_by: Some("planner".to_string()),
            points: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(outcome.points_before.len(), 2);

    let series = expected_values(&pool, link_id).await;
    assert_eq!(series.len(), 3);

    // Past point untouched
    assert_eq!(series[0], (d("2024-01-01"), 100.0));
    // Mar 1 reconnects (Feb 15, 300) -> (Mar 31, 400): 15 of 45 days
    let reconnected = 300.0 + 100.0 * (15.0 / 45.0);
    assert_eq!(series[1].0, d("2024-03-01"));
    assert!((series[1].1 - reconnected).abs() < 1e-9);
    // Final goal unchanged
    assert_eq!(series[2], (d("2024-03-31"), 400.0));

    // State machine re-enters normal, breach bookkeeping is reset
    let link = registry::get_link(&pool, link_id).await.unwrap();
    assert_eq!(link.replan_state, ReplanState::Normal);
    let actuals = datapoints::actual_points(&pool, link_id).await.unwrap();
    assert!(actuals.iter().all(|p| !p.breached()));

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_adjustment_is_audited() {
    let (pool, events, db_path) = setup("audit").await;
    let (link_id, basis) = flagged_link(&pool, &events).await;

    replan::apply_adjustment(
        &pool,
        &events,
        link_id,
        ReplanRequest {
            strategy: AdjustmentStrategy::MaintainFinalGoal,
            basis_actual_id: basis,
            reason: Some("demand spike".to_string()),
            adjusted_by: Some("planner".to_string()),
            points: None,
        },
    )
    .await
    .unwrap();

    let (strategy, triggered_by, reason): (String, String, Option<String>) =
        sqlx::query_as("SELECT strategy, triggered_by, reason FROM replan_adjustments WHERE link_id = ?")
            .bind(link_id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(strategy, "maintain_final_goal");
    assert_eq!(triggered_by, basis.to_string());
    assert_eq!(reason.as_deref(), Some("demand spike"));

    let (before, after): (String, String) =
        sqlx::query_as("SELECT points_before, points_after FROM replan_adjustments WHERE link_id = ?")
            .bind(link_id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
    let before: Vec<CustomPoint> = serde_json::from_str(&before).unwrap();
    let after: Vec<CustomPoint> = serde_json::from_str(&after).unwrap();
    assert_eq!(before.len(), 2);
    assert_eq!(after.len(), 2);
    assert_eq!(before[0].value, 300.0);

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_proportional_shift_moves_future_points() {
    let (pool, events, db_path) = setup("shift").await;
    let (link_id, basis) = flagged_link(&pool, &events).await;

    replan::apply_adjustment(
        &pool,
        &events,
        link_id,
        ReplanRequest {
            strategy: AdjustmentStrategy::ProportionalShift,
            basis_actual_id: basis,
            reason: None,
            adjusted_by: None,
            points: None,
        },
    )
    .await
    .unwrap();

    // Delta at Feb 15: actual 300 - expected 250 = +50
    let series = expected_values(&pool, link_id).await;
    assert_eq!(series[0], (d("2024-01-01"), 100.0));
    assert_eq!(series[1], (d("2024-03-01"), 350.0));
    assert_eq!(series[2], (d("2024-03-31"), 450.0));

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_custom_replaces_future_window() {
    let (pool, events, db_path) = setup("custom").await;
    let (link_id, basis) = flagged_link(&pool, &events).await;

    replan::apply_adjustment(
        &pool,
        &events,
        link_id,
        ReplanRequest {
            strategy: AdjustmentStrategy::Custom,
            basis_actual_id: basis,
            reason: None,
            adjusted_by: Some("planner".to_string()),
            points: Some(vec![
                CustomPoint { effective_date: d("2024-03-10"), value: 330.0 },
                CustomPoint { effective_date: d("2024-03-31"), value: 420.0 },
            ]),
        },
    )
    .await
    .unwrap();

    let series = expected_values(&pool, link_id).await;
    assert_eq!(
        series,
        vec![
            (d("2024-01-01"), 100.0),
            (d("2024-03-10"), 330.0),
            (d("2024-03-31"), 420.0),
        ]
    );

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_custom_validates_replacement_series() {
    let (pool, events, db_path) = setup("custom-invalid").await;
    let (link_id, basis) = flagged_link(&pool, &events).await;

    // Dates not strictly increasing
    let result = replan::apply_adjustment(
        &pool,
        &events,
        link_id,
        ReplanRequest {
            strategy: AdjustmentStrategy::Custom,
            basis_actual_id: basis,
            reason: None,
            adjusted_by: None,
            points: Some(vec![
                CustomPoint { effective_date: d("2024-03-10"), value: 330.0 },
                CustomPoint { effective_date: d("2024-03-10"), value: 340.0 },
            ]),
        },
    )
    .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    // Missing series entirely
    let result = replan::apply_adjustment(
        &pool,
        &events,
        link_id,
        ReplanRequest {
            strategy: AdjustmentStrategy::Custom,
            basis_actual_id: basis,
            reason: None,
            adjusted_by: None,
            points: None,
        },
    )
    .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    // Failed attempts must leave the series and state untouched
    let series = expected_values(&pool, link_id).await;
    assert_eq!(series.len(), 3);
    let link = registry::get_link(&pool, link_id).await.unwrap();
    assert_eq!(link.replan_state, ReplanState::Flagged);

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_basis_must_be_an_actual_of_the_link() {
    let (pool, events, db_path) = setup("foreign-basis").await;
    let (link_id, _) = flagged_link(&pool, &events).await;
    let (_, foreign_basis) = flagged_link(&pool, &events).await;

    let result = replan::apply_adjustment(
        &pool,
        &events,
        link_id,
        ReplanRequest {
            strategy: AdjustmentStrategy::ProportionalShift,
            basis_actual_id: foreign_basis,
            reason: None,
            adjusted_by: None,
            points: None,
        },
    )
    .await;
    assert!(matches!(result, Err(Error::Validation(_))));

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_dismiss_acknowledges_without_changes() {
    let (pool, events, db_path) = setup("dismiss").await;
    let (link_id, _) = flagged_link(&pool, &events).await;

    let before = expected_values(&pool, link_id).await;
    let link = replan::dismiss(&pool, &events, link_id).await.unwrap();
    assert_eq!(link.replan_state, ReplanState::Dismissed);
    assert_eq!(expected_values(&pool, link_id).await, before);

    // Dismissing twice is invalid: the link is no longer flagged
    let result = replan::dismiss(&pool, &events, link_id).await;
    assert!(matches!(result, Err(Error::Validation(_))));

    // A non-breaching reading returns the link to normal
    datapoints::record_actual(
        &pool,
        &events,
        link_id,
        NewActual {
            subtype: ActualSubtype::Measured,
            value: 310.0,
            effective_date: d("2024-03-05"),
            period_start: None,
            source: None,
            recorded_by: None,
        },
    )
    .await
    .unwrap();
    let link = registry::get_link(&pool, link_id).await.unwrap();
    assert_eq!(link.replan_state, ReplanState::Normal);

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}
