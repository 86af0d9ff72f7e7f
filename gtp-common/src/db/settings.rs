//! Typed access to the settings table

use crate::Result;
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::warn;

/// Read a setting and parse it to the requested type
///
/// Returns `None` when the key is absent or the value is NULL.
pub async fn get_setting<T: FromStr>(pool: &SqlitePool, key: &str) -> Result<Option<T>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match value.flatten() {
        Some(raw) => match raw.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => {
                warn!("Setting '{}' has unparseable value '{}'", key, raw);
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// Read a setting, falling back to `default` when absent or unparseable
pub async fn get_setting_or<T: FromStr>(pool: &SqlitePool, key: &str, default: T) -> T {
    match get_setting::<T>(pool, key).await {
        Ok(Some(v)) => v,
        Ok(None) => default,
        Err(e) => {
            warn!("Failed to read setting '{}': {}", key, e);
            default
        }
    }
}

/// Write a setting value
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}
