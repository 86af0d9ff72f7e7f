//! Database initialization
//!
//! Creates the engine schema on first run and re-applies idempotently on
//! every startup. The partial unique indexes on `measure_links` are load
//! bearing: goal-level and strategy-level link uniqueness and the
//! one-primary-per-goal invariant are enforced here, at the storage layer,
//! so concurrent check-then-insert races cannot produce duplicates.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Foreign keys and busy timeout are per-connection in SQLite, so they
    // are set as connection options rather than one-off pragmas; cascade
    // deletion of a link's data points depends on them. WAL allows
    // concurrent readers with one writer.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Schema creation (idempotent - safe to call multiple times)
    create_settings_table(&pool).await?;
    create_module_config_table(&pool).await?;
    create_measure_links_table(&pool).await?;
    create_measure_data_points_table(&pool).await?;
    create_replan_adjustments_table(&pool).await?;

    init_default_settings(&pool).await?;

    Ok(pool)
}

/// Create the settings table
///
/// Stores engine configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_module_config_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS module_config (
            module_name TEXT PRIMARY KEY CHECK (module_name IN ('measure_engine', 'alignment_service')),
            host TEXT NOT NULL,
            port INTEGER NOT NULL CHECK (port > 0 AND port <= 65535),
            enabled INTEGER NOT NULL DEFAULT 1,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Initialize default module configurations
    let defaults = vec![
        ("measure_engine", "127.0.0.1", 5731),
        ("alignment_service", "127.0.0.1", 5732),
    ];

    for (module_name, host, port) in defaults {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO module_config (module_name, host, port, enabled)
            VALUES (?, ?, ?, 1)
            "#,
        )
        .bind(module_name)
        .bind(host)
        .bind(port)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Create the measure_links table
///
/// One row per association between a measure, a responsible person, and an
/// optional goal/strategy context.
pub async fn create_measure_links_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measure_links (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            measure_id TEXT NOT NULL,
            person_id TEXT NOT NULL,
            goal_id TEXT,
            strategy_id TEXT,
            threshold_pct REAL,
            link_type TEXT,
            weight REAL,
            display_order INTEGER NOT NULL DEFAULT 0,
            is_primary INTEGER NOT NULL DEFAULT 0,
            replan_state TEXT NOT NULL DEFAULT 'normal',
            linked_at TEXT NOT NULL,
            linked_by TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (strategy_id IS NULL OR goal_id IS NOT NULL),
            CHECK (threshold_pct IS NULL OR (threshold_pct >= 0.0 AND threshold_pct <= 100.0)),
            CHECK (weight IS NULL OR (weight >= 0.0 AND weight <= 1.0)),
            CHECK (is_primary IN (0, 1)),
            CHECK (replan_state IN ('normal', 'flagged', 'dismissed'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Goal-level links: one per (measure, goal) when no strategy is set
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_links_goal_level
         ON measure_links(measure_id, goal_id)
         WHERE strategy_id IS NULL AND goal_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    // Strategy-level links: one per (measure, strategy)
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_links_strategy_level
         ON measure_links(measure_id, strategy_id)
         WHERE strategy_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    // At most one primary link per goal
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_links_primary
         ON measure_links(goal_id)
         WHERE is_primary = 1",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_measure ON measure_links(measure_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_person ON measure_links(person_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_goal ON measure_links(goal_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the measure_data_points table
///
/// Target and actual values attached to a link. Category and subtype are
/// constrained together so a target can never carry actual-only fields'
/// subtypes and vice versa. Rows are never deleted except by cascade when
/// their link is removed.
pub async fn create_measure_data_points_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measure_data_points (
            id TEXT PRIMARY KEY,
            link_id TEXT NOT NULL REFERENCES measure_links(id) ON DELETE CASCADE,
            category TEXT NOT NULL,
            subtype TEXT NOT NULL,
            value REAL NOT NULL,
            effective_date TEXT NOT NULL,
            period_start TEXT,
            label TEXT,
            confidence INTEGER,
            rationale TEXT,
            original_value REAL,
            manual_override INTEGER NOT NULL DEFAULT 0,
            override_comment TEXT,
            source TEXT,
            breach INTEGER NOT NULL DEFAULT 0,
            recorded_by TEXT,
            recorded_at TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (category IN ('target', 'actual')),
            CHECK (category != 'target' OR subtype IN ('expected', 'optimal', 'minimal')),
            CHECK (category != 'actual' OR subtype IN ('estimate', 'measured')),
            CHECK (confidence IS NULL OR (confidence >= 1 AND confidence <= 5)),
            CHECK (category = 'target' OR confidence IS NULL),
            CHECK (category = 'target' OR rationale IS NULL),
            CHECK (category = 'actual' OR source IS NULL),
            CHECK (category = 'actual' OR original_value IS NULL),
            CHECK (manual_override IN (0, 1)),
            CHECK (breach IN (0, 1)),
            CHECK (category = 'actual' OR breach = 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One point per (link, subtype, date); corrections update in place.
    // An estimate and a measured actual may coexist on the same date
    // because they are distinct subtypes.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_points_link_subtype_date
         ON measure_data_points(link_id, category, subtype, effective_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_points_link_date
         ON measure_data_points(link_id, effective_date)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the replan_adjustments table
///
/// Audit record of every replanning adjustment: which strategy ran, which
/// actual triggered it, and the affected target points before and after
/// (JSON arrays).
pub async fn create_replan_adjustments_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS replan_adjustments (
            id TEXT PRIMARY KEY,
            link_id TEXT NOT NULL REFERENCES measure_links(id) ON DELETE CASCADE,
            strategy TEXT NOT NULL CHECK (strategy IN ('maintain_final_goal', 'proportional_shift', 'custom')),
            triggered_by TEXT NOT NULL,
            points_before TEXT NOT NULL,
            points_after TEXT NOT NULL,
            reason TEXT,
            adjusted_by TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_adjustments_link ON replan_adjustments(link_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or update default settings
///
/// Ensures all required settings exist with default values; NULL values
/// are reset to defaults.
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Variance / replanning
    ensure_setting(pool, "interpolation_method", "linear").await?;
    ensure_setting(pool, "default_variance_threshold_pct", "10").await?;
    ensure_setting(pool, "replan_consecutive_breaches", "2").await?;

    // Impact bands (|variance %| x weight)
    ensure_setting(pool, "impact_high_band", "50").await?;
    ensure_setting(pool, "impact_medium_band", "20").await?;

    // Event system
    ensure_setting(pool, "event_bus_capacity", "1000").await?;

    // Alignment service client
    ensure_setting(pool, "alignment_request_timeout_ms", "5000").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if !exists {
        // INSERT OR IGNORE handles concurrent initialization races:
        // multiple tasks may pass the exists check simultaneously
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;

        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;

        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}
