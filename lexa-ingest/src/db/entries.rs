//! Dictionary entry writes

use chrono::Utc;
use lexa_common::Result;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::parser::ParsedEntry;

/// Stored dictionary entry
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct EntryRow {
    pub key: String,
    pub headword: String,
    pub body: String,
    pub category: Option<String>,
}

/// Insert or refresh one entry by its natural key
///
/// Re-importing the same entry overwrites it in place, so replaying a chunk
/// leaves exactly one row. Cross references become synonym edges.
///
/// Returns `false` when `job_id` already wrote this key (a homograph in the
/// same dump collapsing onto the earlier row).
pub async fn upsert(conn: &mut SqliteConnection, entry: &ParsedEntry, job_id: Uuid) -> Result<bool> {
    let fragments = serde_json::to_string(&entry.fragments)?;
    let cross_refs = serde_json::to_string(&entry.cross_refs)?;
    let job = job_id.to_string();

    let previous_job: Option<String> =
        sqlx::query_scalar::<_, Option<String>>("SELECT job_id FROM dictionary_entries WHERE key = ?")
            .bind(&entry.key)
            .fetch_optional(&mut *conn)
            .await?
            .flatten();

    sqlx::query(
        r#"
        INSERT INTO dictionary_entries (key, headword, body, fragments, category, cross_refs, job_id, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            headword = excluded.headword,
            body = excluded.body,
            fragments = excluded.fragments,
            category = excluded.category,
            cross_refs = excluded.cross_refs,
            job_id = excluded.job_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&entry.key)
    .bind(&entry.headword)
    .bind(entry.body())
    .bind(fragments)
    .bind(&entry.category)
    .bind(cross_refs)
    .bind(&job)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    for target in &entry.cross_refs {
        super::lexicon::insert_synonym(&mut *conn, &entry.key, target).await?;
    }

    Ok(previous_job.as_deref() != Some(job.as_str()))
}

pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<EntryRow>> {
    let row = sqlx::query_as::<_, EntryRow>(
        "SELECT key, headword, body, category FROM dictionary_entries WHERE key = ?",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn count(pool: &SqlitePool) -> Result<u64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dictionary_entries")
        .fetch_one(pool)
        .await?;
    Ok(n as u64)
}
