//! Integration tests for the data point store
//!
//! Covers series ordering, inline variance on actual recording, the
//! breach/flagging policy, batch upsert atomicity, override
//! bookkeeping, and cascade removal with the owning link.

use chrono::NaiveDate;
use gtp_common::db::init::init_database;
use gtp_common::db::models::{ActualSubtype, DataPointCategory, ReplanState, TargetSubtype};
use gtp_common::events::EventBus;
use gtp_common::Error;
use gtp_me::datapoints::{self, NewActual, NewTarget, TargetUpsert};
use gtp_me::registry::{self, NewLink};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

async fn setup(tag: &str) -> (SqlitePool, Arc<EventBus>, PathBuf) {
    let db_path = PathBuf::from(format!(
        "/tmp/gtp-me-points-{}-{}.db",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&db_path);
    let pool = init_database(&db_path).await.expect("init database");
    (pool, Arc::new(EventBus::new(16)), db_path)
}

async fn make_link(pool: &SqlitePool, events: &EventBus) -> Uuid {
    registry::create_link(
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
    .id
}

fn target(subtype: TargetSubtype, value: f64, date: &str) -> NewTarget {
    NewTarget {
        subtype,
        value,
        effective_date: d(date),
        period_start: None,
        label: None,
        confidence: None,
        rationale: None,
        recorded_by: None,
    }
}

fn actual(subtype: ActualSubtype, value: f64, date: &str) -> NewActual {
    NewActual {
        subtype,
        value,
        effective_date: d(date),
        period_start: None,
        source: Some("test".to_string()),
        recorded_by: None,
    }
}

/// Seed the quarter plan used across tests: (Jan 1, 100) .. (Mar 31, 400)
async fn seed_quarter_plan(pool: &SqlitePool, link_id: Uuid) {
    datapoints::create_target(pool, link_id, target(TargetSubtype::Expected, 100.0, "2024-01-01"))
        .await
        .unwrap();
    datapoints::create_target(pool, link_id, target(TargetSubtype::Expected, 400.0, "2024-03-31"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_series_is_ordered_by_date() {
    let (pool, events, db_path) = setup("ordering").await;
    let link_id = make_link(&pool, &events).await;

    for (value, date) in [(400.0, "2024-03-31"), (100.0, "2024-01-01"), (250.0, "2024-02-15")] {
        datapoints::create_target(&pool, link_id, target(TargetSubtype::Expected, value, date))
            .await
            .unwrap();
    }

    let series = datapoints::get_series(
        &pool,
        link_id,
        DataPointCategory::Target,
        Some("expected"),
        None,
        None,
    )
    .await
    .unwrap();
    let dates: Vec<_> = series.iter().map(|p| p.effective_date).collect();
    assert_eq!(dates, vec![d("2024-01-01"), d("2024-02-15"), d("2024-03-31")]);

    // Date-range restriction
    let windowed = datapoints::get_series(
        &pool,
        link_id,
        DataPointCategory::Target,
        Some("expected"),
        Some(d("2024-02-01")),
        Some(d("2024-03-01")),
    )
    .await
    .unwrap();
    assert_eq!(windowed.len(), 1);
    assert_eq!(windowed[0].effective_date, d("2024-02-15"));

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_confidence_range_is_validated() {
    let (pool, events, db_path) = setup("confidence").await;
    let link_id = make_link(&pool, &events).await;

    let mut req = target(TargetSubtype::Expected, 100.0, "2024-01-01");
    req.confidence = Some(6);
    assert!(matches!(
        datapoints::create_target(&pool, link_id, req).await,
        Err(Error::Validation(_))
    ));

    let mut req = target(TargetSubtype::Expected, 100.0, "2024-01-01");
    req.confidence = Some(5);
    datapoints::create_target(&pool, link_id, req).await.unwrap();

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_record_actual_returns_interpolated_variance() {
    let (pool, events, db_path) = setup("variance").await;
    let link_id = make_link(&pool, &events).await;
    seed_quarter_plan(&pool, link_id).await;

    let recorded = datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 300.0, "2024-02-15"),
    )
    .await
    .unwrap();

    // 45 days into the 90-day span: expected 250, variance 50 = 20%
    assert_eq!(recorded.variance.expected, Some(250.0));
    assert_eq!(recorded.variance.variance, Some(50.0));
    assert!((recorded.variance.variance_pct.unwrap() - 20.0).abs() < 1e-9);

    // 20% > default threshold 10% -> breach, but one breach never flags
    assert!(recorded.point.breached());
    assert!(!recorded.replan_flagged);
    let link = registry::get_link(&pool, link_id).await.unwrap();
    assert_eq!(link.replan_state, ReplanState::Normal);

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_actual_outside_series_has_undefined_variance() {
    let (pool, events, db_path) = setup("undefined").await;
    let link_id = make_link(&pool, &events).await;
    seed_quarter_plan(&pool, link_id).await;

    let recorded = datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 300.0, "2024-04-15"),
    )
    .await
    .unwrap();

    assert_eq!(recorded.variance.expected, None);
    assert_eq!(recorded.variance.variance, None);
    assert_eq!(recorded.variance.variance_pct, None);
    assert!(!recorded.point.breached(), "undefined variance never breaches");

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_two_consecutive_breaches_flag_the_link() {
    let (pool, events, db_path) = setup("flagging").await;
    let link_id = make_link(&pool, &events).await;
    seed_quarter_plan(&pool, link_id).await;

    // Expected at Jan 31 is 200; 250 is a 25% breach
    let first = datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 250.0, "2024-01-31"),
    )
    .await
    .unwrap();
    assert!(first.point.breached());
    assert!(!first.replan_flagged);

    // Expected at Feb 15 is 250; 300 is a 20% breach - second in a row
    let second = datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 300.0, "2024-02-15"),
    )
    .await
    .unwrap();
    assert!(second.replan_flagged);

    let link = registry::get_link(&pool, link_id).await.unwrap();
    assert_eq!(link.replan_state, ReplanState::Flagged);

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_breach_then_recovery_does_not_flag() {
    let (pool, events, db_path) = setup("recovery").await;
    let link_id = make_link(&pool, &events).await;
    seed_quarter_plan(&pool, link_id).await;

    datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 250.0, "2024-01-31"),
    )
    .await
    .unwrap();

    // Back inside the band: expected 250, actual 255 is 2%
    let recovery = datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 255.0, "2024-02-15"),
    )
    .await
    .unwrap();
    assert!(!recovery.point.breached());
    assert!(!recovery.replan_flagged);

    // A later breach starts a fresh streak of one
    let late = datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 400.0, "2024-03-01"),
    )
    .await
    .unwrap();
    assert!(late.point.breached());
    assert!(!late.replan_flagged);

    let link = registry::get_link(&pool, link_id).await.unwrap();
    assert_eq!(link.replan_state, ReplanState::Normal);

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_duplicate_actual_for_date_conflicts() {
    let (pool, events, db_path) = setup("dup-actual").await;
    let link_id = make_link(&pool, &events).await;
    seed_quarter_plan(&pool, link_id).await;

    datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 300.0, "2024-02-15"),
    )
    .await
    .unwrap();

    let dup = datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 310.0, "2024-02-15"),
    )
    .await;
    assert!(matches!(dup, Err(Error::Conflict(_))));

    // An estimate for the same date is a different subtype and is kept
    datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Estimate, 290.0, "2024-02-15"),
    )
    .await
    .unwrap();

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_batch_upsert_is_atomic() {
    let (pool, events, db_path) = setup("batch-atomic").await;
    let link_id = make_link(&pool, &events).await;

    let existing = datapoints::create_target(
        &pool,
        link_id,
        target(TargetSubtype::Expected, 100.0, "2024-01-01"),
    )
    .await
    .unwrap();

    // Second item references a nonexistent point; the whole batch must
    // roll back, including the first item's update and the new point
    let result = datapoints::batch_upsert_targets(
        &pool,
        link_id,
        vec![
            TargetUpsert {
                id: Some(existing.id),
                subtype: TargetSubtype::Expected,
                value: 150.0,
                effective_date: d("2024-01-01"),
                period_start: None,
                label: None,
                confidence: None,
                rationale: None,
            },
            TargetUpsert {
                id: None,
                subtype: TargetSubtype::Expected,
                value: 400.0,
                effective_date: d("2024-03-31"),
                period_start: None,
                label: None,
                confidence: None,
                rationale: None,
            },
            TargetUpsert {
                id: Some(Uuid::new_v4()),
                subtype: TargetSubtype::Expected,
                value: 999.0,
                effective_date: d("2024-06-30"),
                period_start: None,
                label: None,
                confidence: None,
                rationale: None,
            },
        ],
    )
    .await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    let series = datapoints::get_series(
        &pool,
        link_id,
        DataPointCategory::Target,
        Some("expected"),
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(series.len(), 1, "no point from the failed batch may persist");
    assert_eq!(series[0].value, 100.0, "the failed batch must not update values");

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_batch_upsert_mixes_create_and_update() {
    let (pool, events, db_path) = setup("batch-mixed").await;
    let link_id = make_link(&pool, &events).await;

    let existing = datapoints::create_target(
        &pool,
        link_id,
        target(TargetSubtype::Expected, 100.0, "2024-01-01"),
    )
    .await
    .unwrap();

    let points = datapoints::batch_upsert_targets(
        &pool,
        link_id,
        vec![
            TargetUpsert {
                id: Some(existing.id),
                subtype: TargetSubtype::Expected,
                value: 120.0,
                effective_date: d("2024-01-01"),
                period_start: None,
                label: None,
                confidence: None,
                rationale: Some("baseline restated".to_string()),
            },
            TargetUpsert {
                id: None,
                subtype: TargetSubtype::Expected,
                value: 400.0,
                effective_date: d("2024-03-31"),
                period_start: None,
                label: None,
                confidence: Some(4),
                rationale: None,
            },
        ],
    )
    .await
    .unwrap();

    assert_eq!(points.len(), 2);
    assert_eq!(points[0].id, existing.id);
    assert_eq!(points[0].value, 120.0);

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_update_actual_preserves_original_value_once() {
    let (pool, events, db_path) = setup("override").await;
    let link_id = make_link(&pool, &events).await;
    seed_quarter_plan(&pool, link_id).await;

    let recorded = datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 300.0, "2024-02-15"),
    )
    .await
    .unwrap();

    // Correction without a comment is rejected
    let result = datapoints::update_actual(&pool, recorded.point.id, 310.0, "  ").await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let corrected = datapoints::update_actual(&pool, recorded.point.id, 310.0, "meter drift")
        .await
        .unwrap();
    match &corrected.kind {
        gtp_common::db::models::PointKind::Actual { override_info, .. } => {
            let info = override_info.as_ref().unwrap();
            assert_eq!(info.original_value, 300.0);
            assert_eq!(info.comment.as_deref(), Some("meter drift"));
        }
        _ => panic!("expected actual"),
    }
    assert_eq!(corrected.value, 310.0);

    // Second correction keeps the original original_value
    let again = datapoints::update_actual(&pool, recorded.point.id, 320.0, "second pass")
        .await
        .unwrap();
    match &again.kind {
        gtp_common::db::models::PointKind::Actual { override_info, .. } => {
            assert_eq!(again.value, 320.0);
            assert_eq!(override_info.as_ref().unwrap().original_value, 300.0);
        }
        _ => panic!("expected actual"),
    }

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_update_target_rejects_actual_and_vice_versa() {
    let (pool, events, db_path) = setup("category-immutable").await;
    let link_id = make_link(&pool, &events).await;
    seed_quarter_plan(&pool, link_id).await;

    let recorded = datapoints::record_actual(
        &pool,
        &events,
        link_id,
        actual(ActualSubtype::Measured, 300.0, "2024-02-15"),
    )
    .await
    .unwrap();

    assert!(matches!(
        datapoints::update_target(&pool, recorded.point.id, 5.0, None).await,
        Err(Error::Validation(_))
    ));

    let series = datapoints::get_series(
        &pool,
        link_id,
        DataPointCategory::Target,
        Some("expected"),
        None,
        None,
    )
    .await
    .unwrap();
    assert!(matches!(
        datapoints::update_actual(&pool, series[0].id, 5.0, "nope").await,
        Err(Error::Validation(_))
    ));

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_unlink_cascades_data_points() {
    let (pool, events, db_path) = setup("cascade").await;
    let link_id = make_link(&pool, &events).await;
    seed_quarter_plan(&pool, link_id).await;

    let series = datapoints::get_series(
        &pool,
        link_id,
        DataPointCategory::Target,
        Some("expected"),
        None,
        None,
    )
    .await
    .unwrap();
    let point_id = series[0].id;

    registry::unlink(&pool, &events, link_id, None).await.unwrap();

    assert!(matches!(
        datapoints::get_point(&pool, point_id).await,
        Err(Error::NotFound(_))
    ));

    drop(pool);
    let _ = std::fs::remove_file(&db_path);
}
