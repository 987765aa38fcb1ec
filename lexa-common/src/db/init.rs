//! Database initialization
//!
//! Creates the SQLite database on first run and brings the schema up to date.
//! Every statement is idempotent, so startup may run it any number of times.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows concurrent readers with one writer
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    create_schema(&pool).await?;
    apply_busy_timeout(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database (tests and dry runs)
///
/// Every pooled connection to `:memory:` would be a separate database, so the
/// pool is capped at one connection.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create every table and index used by the Lexa services
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    create_settings_table(pool).await?;
    create_jobs_table(pool).await?;
    create_job_units_table(pool).await?;
    create_dictionary_entries_table(pool).await?;
    create_annotations_table(pool).await?;
    create_lexicon_tables(pool).await?;
    create_classifier_cache_table(pool).await?;

    init_default_settings(pool).await?;

    Ok(())
}

/// Create the settings table
///
/// Stores application configuration key-value pairs.
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

/// Job records - the durable contract between chunk invocations
///
/// `lease_expires_at` is epoch milliseconds so expiry can be compared in SQL.
async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            source TEXT NOT NULL,
            total_units INTEGER NOT NULL DEFAULT 0,
            processed_count INTEGER NOT NULL DEFAULT 0,
            inserted_count INTEGER NOT NULL DEFAULT 0,
            unresolved_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            cursor INTEGER NOT NULL DEFAULT 0,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            cancel_reason TEXT,
            message TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            lease_owner TEXT,
            lease_expires_at INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Staged unit sequence of a job, released when the job finishes
async fn create_job_units_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_units (
            job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (job_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_dictionary_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dictionary_entries (
            key TEXT PRIMARY KEY,
            headword TEXT NOT NULL,
            body TEXT NOT NULL,
            fragments TEXT NOT NULL DEFAULT '[]',
            category TEXT,
            cross_refs TEXT NOT NULL DEFAULT '[]',
            job_id TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Resolution output per corpus word occurrence
///
/// `curated = 1` rows belong to human curation and are never overwritten by
/// machine runs.
async fn create_annotations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS annotations (
            unit_key TEXT PRIMARY KEY,
            word TEXT NOT NULL,
            classification TEXT NOT NULL,
            confidence REAL NOT NULL,
            strategy TEXT NOT NULL,
            strategy_rank INTEGER NOT NULL,
            is_propagated INTEGER NOT NULL DEFAULT 0,
            curated INTEGER NOT NULL DEFAULT 0,
            job_id TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_annotations_word ON annotations(word)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Cascade lookup tables: exact-match cache, general lexicon, synonym graph
async fn create_lexicon_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resolution_cache (
            word TEXT PRIMARY KEY,
            classification TEXT NOT NULL,
            confidence REAL NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS general_lexicon (
            word TEXT NOT NULL,
            pos TEXT NOT NULL,
            classification TEXT NOT NULL,
            confidence REAL NOT NULL,
            PRIMARY KEY (word, pos)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS synonyms (
            word TEXT NOT NULL,
            synonym TEXT NOT NULL,
            PRIMARY KEY (word, synonym)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Generative classifier answers keyed by (word, context hash)
///
/// A NULL classification records that the classifier had no opinion.
async fn create_classifier_cache_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classifier_cache (
            word TEXT NOT NULL,
            context_hash TEXT NOT NULL,
            classification TEXT,
            confidence REAL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (word, context_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize default settings
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Total time a write may spend retrying "database is locked"
    ensure_setting(pool, "database_max_lock_wait_ms", "5000").await?;
    // SQLite busy_timeout before a lock error surfaces to the retry loop
    ensure_setting(pool, "database_lock_retry_ms", "250").await?;
    Ok(())
}

/// Insert a default unless the key already holds a non-NULL value
async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        WHERE settings.value IS NULL
        "#,
    )
    .bind(key)
    .bind(default_value)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        info!("Initialized setting '{}' with default value: {}", key, default_value);
    }

    Ok(())
}

/// Apply the configured busy timeout so short lock waits reach the retry loop
async fn apply_busy_timeout(pool: &SqlitePool) -> Result<()> {
    let timeout_ms: i64 = sqlx::query_scalar(
        "SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'database_lock_retry_ms'",
    )
    .fetch_optional(pool)
    .await?
    .unwrap_or(250);

    let pragma_sql = format!("PRAGMA busy_timeout = {}", timeout_ms);
    sqlx::query(&pragma_sql).execute(pool).await?;

    info!("Database busy timeout set to {} ms", timeout_ms);
    Ok(())
}
