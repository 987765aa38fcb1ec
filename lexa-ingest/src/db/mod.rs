//! Database access for lexa-ingest
//!
//! Free functions over the shared SQLite pool. The schema itself lives in
//! `lexa_common::db`; functions that must join a chunk's transaction take a
//! `&mut SqliteConnection` instead of the pool.

pub mod annotations;
pub mod classifier_cache;
pub mod entries;
pub mod jobs;
pub mod lexicon;
pub mod settings;
pub mod units;

use lexa_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

pub use classifier_cache::SqliteClassificationCache;

/// Open (creating if needed) the service database in `db_path`
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    tracing::debug!("Connecting to database: {}", db_path.display());
    let pool = lexa_common::db::init_database(db_path).await?;
    tracing::info!("Database ready: {}", db_path.display());
    Ok(pool)
}

/// Cheap liveness probe used by the health endpoint
pub async fn ping(pool: &SqlitePool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
