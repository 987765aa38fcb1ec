//! Staged unit sequence
//!
//! A job's source is parsed once, when the job is created, and its units are
//! stored in order. Chunks then address units by position, so every
//! invocation sees the same deterministic sequence.

use lexa_common::Result;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::models::Unit;

/// Rows per multi-row INSERT (3 binds each, well under SQLite's limit)
const STAGE_BATCH: usize = 500;

/// Append `units` to the job's sequence starting at `first_seq`
pub async fn stage(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    first_seq: u64,
    units: &[Unit],
) -> Result<()> {
    let job_id = job_id.to_string();

    for (batch_index, batch) in units.chunks(STAGE_BATCH).enumerate() {
        let base = first_seq + (batch_index * STAGE_BATCH) as u64;
        let payloads = batch
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO job_units (job_id, seq, payload) ");
        builder.push_values(payloads.into_iter().enumerate(), |mut row, (offset, payload)| {
            row.push_bind(job_id.as_str())
                .push_bind((base + offset as u64) as i64)
                .push_bind(payload);
        });
        builder.build().execute(&mut *conn).await?;
    }

    Ok(())
}

/// Units `[from, from + limit)` in sequence order
pub async fn load_range(pool: &SqlitePool, job_id: Uuid, from: u64, limit: usize) -> Result<Vec<Unit>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT payload FROM job_units WHERE job_id = ? AND seq >= ? ORDER BY seq LIMIT ?",
    )
    .bind(job_id.to_string())
    .bind(from as i64)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(payload,)| serde_json::from_str(&payload).map_err(Into::into))
        .collect()
}

pub async fn count(pool: &SqlitePool, job_id: Uuid) -> Result<u64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_units WHERE job_id = ?")
        .bind(job_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(n as u64)
}

/// Drop the staged sequence of a finished job
pub async fn release(pool: &SqlitePool, job_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM job_units WHERE job_id = ?")
        .bind(job_id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
