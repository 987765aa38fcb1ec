//! Settings database operations
//!
//! Key-value accessors over the shared `settings` table.

use sqlx::{Pool, Sqlite};
use lexa_common::{Error, Result};

/// Key holding the generative classifier API key
pub const CLASSIFIER_API_KEY: &str = "classifier_api_key";

/// Total time a write may spend retrying "database is locked"
pub async fn max_lock_wait_ms(db: &Pool<Sqlite>) -> Result<u64> {
    get_setting(db, "database_max_lock_wait_ms")
        .await
        .map(|opt| opt.unwrap_or(5000))
}

pub async fn get_classifier_api_key(db: &Pool<Sqlite>) -> Result<Option<String>> {
    let key: Option<String> = get_setting(db, CLASSIFIER_API_KEY).await?;
    Ok(key.filter(|k| !k.trim().is_empty()))
}

pub async fn set_classifier_api_key(db: &Pool<Sqlite>, key: String) -> Result<()> {
    set_setting(db, CLASSIFIER_API_KEY, key).await
}

/// Generic setting getter
///
/// A NULL value reads as unset.
pub async fn get_setting<T>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match row.and_then(|(value,)| value) {
        Some(value) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Setting '{}' is invalid: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Generic setting setter (upsert)
pub async fn set_setting<T>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexa_common::db::init_memory_database;

    #[tokio::test]
    async fn test_default_lock_wait_from_schema_defaults() {
        let pool = init_memory_database().await.unwrap();
        assert_eq!(max_lock_wait_ms(&pool).await.unwrap(), 5000);

        set_setting(&pool, "database_max_lock_wait_ms", 750).await.unwrap();
        assert_eq!(max_lock_wait_ms(&pool).await.unwrap(), 750);
    }

    #[tokio::test]
    async fn test_api_key_round_trip_and_blank_is_unset() {
        let pool = init_memory_database().await.unwrap();
        assert_eq!(get_classifier_api_key(&pool).await.unwrap(), None);

        set_classifier_api_key(&pool, "sk-test".to_string()).await.unwrap();
        assert_eq!(get_classifier_api_key(&pool).await.unwrap(), Some("sk-test".to_string()));

        set_classifier_api_key(&pool, "  ".to_string()).await.unwrap();
        assert_eq!(get_classifier_api_key(&pool).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unparseable_setting_is_config_error() {
        let pool = init_memory_database().await.unwrap();
        set_setting(&pool, "database_max_lock_wait_ms", "soon").await.unwrap();
        assert!(matches!(max_lock_wait_ms(&pool).await, Err(Error::Config(_))));
    }
}
