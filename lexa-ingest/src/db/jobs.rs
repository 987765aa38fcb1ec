//! Job store
//!
//! Every mutation of `status` and `cursor` is a compare-and-set: the UPDATE
//! names the value the caller last saw, and zero affected rows means another
//! invocation got there first ([`Error::Conflict`]).

use chrono::{DateTime, Utc};
use lexa_common::jobs::{JobKind, JobStatus};
use lexa_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::models::{ChunkTally, Job, JobMetadata, SourceReference};
use crate::utils::retry_on_lock;

use super::settings::max_lock_wait_ms;

const JOB_COLUMNS: &str = r#"
    id, kind, status, source, total_units, processed_count, inserted_count,
    unresolved_count, error_count, cursor, cancel_requested, cancel_reason,
    message, metadata, created_at, updated_at, started_at, finished_at
"#;

fn parse_time(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id: String = row.get("id");
    let id = Uuid::parse_str(&id).map_err(|e| Error::Internal(format!("Invalid job id {}: {}", id, e)))?;
    let kind: JobKind = row.get::<String, _>("kind").parse()?;
    let status: JobStatus = row.get::<String, _>("status").parse()?;
    let source: SourceReference = serde_json::from_str(&row.get::<String, _>("source"))?;
    let metadata: JobMetadata = serde_json::from_str(&row.get::<String, _>("metadata"))?;

    let started_at: Option<String> = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");

    Ok(Job {
        id,
        kind,
        status,
        source,
        total_units: row.get::<i64, _>("total_units") as u64,
        processed_count: row.get::<i64, _>("processed_count") as u64,
        inserted_count: row.get::<i64, _>("inserted_count") as u64,
        unresolved_count: row.get::<i64, _>("unresolved_count") as u64,
        error_count: row.get::<i64, _>("error_count") as u64,
        cursor: row.get::<i64, _>("cursor") as u64,
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        cancel_reason: row.get("cancel_reason"),
        message: row.get("message"),
        metadata,
        created_at: parse_time(&row.get::<String, _>("created_at"), "created_at")?,
        updated_at: parse_time(&row.get::<String, _>("updated_at"), "updated_at")?,
        started_at: started_at.as_deref().map(|s| parse_time(s, "started_at")).transpose()?,
        finished_at: finished_at.as_deref().map(|s| parse_time(s, "finished_at")).transpose()?,
    })
}

/// Insert a freshly created job
pub async fn insert(conn: &mut SqliteConnection, job: &Job) -> Result<()> {
    let source = serde_json::to_string(&job.source)?;
    let metadata = serde_json::to_string(&job.metadata)?;

    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, kind, status, source, total_units, metadata, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.kind.as_str())
    .bind(job.status.as_str())
    .bind(source)
    .bind(job.total_units as i64)
    .bind(metadata)
    .bind(job.created_at.to_rfc3339())
    .bind(job.updated_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn load(pool: &SqlitePool, id: Uuid) -> Result<Option<Job>> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Load a job that must exist
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Job> {
    load(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Job {} not found", id)))
}

/// Most recently created jobs first
pub async fn list(pool: &SqlitePool, limit: u32) -> Result<Vec<Job>> {
    let sql = format!(
        "SELECT {} FROM jobs ORDER BY created_at DESC, id LIMIT ?",
        JOB_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(limit as i64).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

pub async fn list_by_status(pool: &SqlitePool, status: JobStatus) -> Result<Vec<Job>> {
    let sql = format!(
        "SELECT {} FROM jobs WHERE status = ? ORDER BY created_at",
        JOB_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(status.as_str()).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

/// Running jobs no live worker holds a lease on (crashed invocations)
pub async fn list_resumable(pool: &SqlitePool, now_ms: i64) -> Result<Vec<Job>> {
    let sql = format!(
        r#"
        SELECT {} FROM jobs
        WHERE status = 'running'
          AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at < ?)
        ORDER BY created_at
        "#,
        JOB_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(now_ms).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

/// Compare-and-set `status` from `from` to `to`
///
/// Illegal edges are rejected before touching the store. Sets `started_at`
/// on first entry to running and `finished_at` on entry to a terminal
/// status. `message`, when given, replaces the job message.
pub async fn transition(
    pool: &SqlitePool,
    id: Uuid,
    from: JobStatus,
    to: JobStatus,
    message: Option<&str>,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(Error::Conflict(format!(
            "Illegal job transition {} -> {}",
            from, to
        )));
    }

    let max_wait_ms = max_lock_wait_ms(pool).await?;
    let id_str = id.to_string();
    let now = Utc::now().to_rfc3339();
    let id_ref = id_str.as_str();
    let now_ref = now.as_str();

    let affected = retry_on_lock("job transition", max_wait_ms, || async move {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?,
                message = COALESCE(?, message),
                updated_at = ?,
                started_at = CASE WHEN ? AND started_at IS NULL THEN ? ELSE started_at END,
                finished_at = CASE WHEN ? THEN ? ELSE finished_at END
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(message)
        .bind(now_ref)
        .bind(to == JobStatus::Running)
        .bind(now_ref)
        .bind(to.is_terminal())
        .bind(now_ref)
        .bind(id_ref)
        .bind(from.as_str())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    })
    .await?;

    if affected == 0 {
        return Err(Error::Conflict(format!(
            "Job {} is no longer {}",
            id, from
        )));
    }

    tracing::info!(job_id = %id, from = %from, to = %to, "Job status changed");
    Ok(())
}

/// Advance the checkpoint inside the chunk's transaction
///
/// Compare-and-set on `cursor`: succeeds only if the cursor still equals
/// `expected_cursor` and the job is running (or cancelling, whose chunk in
/// flight still commits). `processed_count` is set to the new cursor, so the
/// two never diverge. Returns the new cursor.
pub async fn checkpoint(
    conn: &mut SqliteConnection,
    id: Uuid,
    expected_cursor: u64,
    tally: &ChunkTally,
    metadata: &JobMetadata,
) -> Result<u64> {
    let metadata = serde_json::to_string(metadata)?;

    let result = sqlx::query(
        r#"
        UPDATE jobs SET
            cursor = cursor + ?,
            processed_count = cursor + ?,
            inserted_count = inserted_count + ?,
            unresolved_count = unresolved_count + ?,
            error_count = error_count + ?,
            metadata = ?,
            updated_at = ?
        WHERE id = ? AND cursor = ? AND status IN ('running', 'cancelling')
        "#,
    )
    .bind(tally.processed as i64)
    .bind(tally.processed as i64)
    .bind(tally.inserted as i64)
    .bind(tally.unresolved as i64)
    .bind(tally.errors as i64)
    .bind(metadata)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(expected_cursor as i64)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!(
            "Checkpoint of job {} lost: cursor is no longer {}",
            id, expected_cursor
        )));
    }

    Ok(expected_cursor + tally.processed)
}

/// Set the cancellation flag
///
/// Idempotent: terminal jobs are left untouched, a second request keeps the
/// first reason. A running job moves to `cancelling`; queued and paused jobs
/// are finalized by the next chunk invocation.
pub async fn request_cancel(pool: &SqlitePool, id: Uuid, reason: Option<&str>) -> Result<Job> {
    let max_wait_ms = max_lock_wait_ms(pool).await?;
    let id_str = id.to_string();
    let now = Utc::now().to_rfc3339();
    let id_ref = id_str.as_str();
    let now_ref = now.as_str();

    retry_on_lock("job cancel request", max_wait_ms, || async move {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE jobs SET
                cancel_requested = 1,
                cancel_reason = COALESCE(cancel_reason, ?),
                updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(reason)
        .bind(now_ref)
        .bind(id_ref)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE jobs SET status = 'cancelling', updated_at = ? WHERE id = ? AND status = 'running'")
            .bind(now_ref)
            .bind(id_ref)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    })
    .await?;

    get(pool, id).await
}

/// Take or renew the per-job advisory lease
///
/// Succeeds when the lease is free, expired, or already held by `owner`.
pub async fn acquire_lease(pool: &SqlitePool, id: Uuid, owner: &str, ttl_ms: u64) -> Result<bool> {
    let now_ms = Utc::now().timestamp_millis();
    let result = sqlx::query(
        r#"
        UPDATE jobs SET lease_owner = ?, lease_expires_at = ?
        WHERE id = ?
          AND (lease_owner IS NULL OR lease_owner = ? OR lease_expires_at IS NULL OR lease_expires_at < ?)
        "#,
    )
    .bind(owner)
    .bind(now_ms + ttl_ms as i64)
    .bind(id.to_string())
    .bind(owner)
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn release_lease(pool: &SqlitePool, id: Uuid, owner: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET lease_owner = NULL, lease_expires_at = NULL WHERE id = ? AND lease_owner = ?")
        .bind(id.to_string())
        .bind(owner)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexa_common::db::init_memory_database;

    async fn setup() -> (SqlitePool, Job) {
        let pool = init_memory_database().await.unwrap();
        let job = Job::new(JobKind::DictionaryImport, SourceReference::Inline("*a*,\nbody".into()), 10);
        let mut conn = pool.acquire().await.unwrap();
        insert(&mut conn, &job).await.unwrap();
        drop(conn);
        (pool, job)
    }

    fn tally(processed: u64) -> ChunkTally {
        ChunkTally {
            processed,
            inserted: processed,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_and_load_round_trip() {
        let (pool, job) = setup().await;
        let loaded = get(&pool, job.id).await.unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.source, job.source);
        assert_eq!(loaded.total_units, 10);
        assert!(loaded.started_at.is_none());

        assert!(matches!(get(&pool, Uuid::new_v4()).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (pool, job) = setup().await;

        transition(&pool, job.id, JobStatus::Queued, JobStatus::Running, None).await.unwrap();
        let running = get(&pool, job.id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        // stale expectation
        let stale = transition(&pool, job.id, JobStatus::Queued, JobStatus::Running, None).await;
        assert!(matches!(stale, Err(Error::Conflict(_))));

        transition(&pool, job.id, JobStatus::Running, JobStatus::Failed, Some("boom")).await.unwrap();
        let failed = get(&pool, job.id).await.unwrap();
        assert_eq!(failed.message.as_deref(), Some("boom"));
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_edge_rejected_without_write() {
        let (pool, job) = setup().await;
        let result = transition(&pool, job.id, JobStatus::Queued, JobStatus::Completed, None).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(get(&pool, job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_checkpoint_advances_cursor_and_processed_together() {
        let (pool, job) = setup().await;
        transition(&pool, job.id, JobStatus::Queued, JobStatus::Running, None).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let cursor = checkpoint(&mut tx, job.id, 0, &tally(4), &JobMetadata::default()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(cursor, 4);

        // replaying the same chunk loses the compare-and-set
        let mut tx = pool.begin().await.unwrap();
        let replay = checkpoint(&mut tx, job.id, 0, &tally(4), &JobMetadata::default()).await;
        assert!(matches!(replay, Err(Error::Conflict(_))));
        tx.rollback().await.unwrap();

        let loaded = get(&pool, job.id).await.unwrap();
        assert_eq!(loaded.cursor, 4);
        assert_eq!(loaded.processed_count, 4);
        assert_eq!(loaded.inserted_count, 4);
    }

    #[tokio::test]
    async fn test_cancel_request_is_idempotent() {
        let (pool, job) = setup().await;
        transition(&pool, job.id, JobStatus::Queued, JobStatus::Running, None).await.unwrap();

        let first = request_cancel(&pool, job.id, Some("wrong file")).await.unwrap();
        assert_eq!(first.status, JobStatus::Cancelling);
        assert!(first.cancel_requested);

        let second = request_cancel(&pool, job.id, Some("again")).await.unwrap();
        assert_eq!(second.status, JobStatus::Cancelling);
        assert_eq!(second.cancel_reason.as_deref(), Some("wrong file"));

        transition(&pool, job.id, JobStatus::Cancelling, JobStatus::Cancelled, None).await.unwrap();
        let done = request_cancel(&pool, job.id, None).await.unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_on_completed_job_is_noop() {
        let (pool, job) = setup().await;
        transition(&pool, job.id, JobStatus::Queued, JobStatus::Running, None).await.unwrap();
        transition(&pool, job.id, JobStatus::Running, JobStatus::Completed, None).await.unwrap();

        let after = request_cancel(&pool, job.id, Some("late")).await.unwrap();
        assert_eq!(after.status, JobStatus::Completed);
        assert!(!after.cancel_requested);
        assert!(after.cancel_reason.is_none());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_released_or_expired() {
        let (pool, job) = setup().await;

        assert!(acquire_lease(&pool, job.id, "worker-a", 60_000).await.unwrap());
        assert!(acquire_lease(&pool, job.id, "worker-a", 60_000).await.unwrap());
        assert!(!acquire_lease(&pool, job.id, "worker-b", 60_000).await.unwrap());

        release_lease(&pool, job.id, "worker-a").await.unwrap();
        assert!(acquire_lease(&pool, job.id, "worker-b", 0).await.unwrap());

        // zero ttl expires immediately
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(acquire_lease(&pool, job.id, "worker-c", 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_resumable_lists_running_jobs_without_live_lease() {
        let (pool, job) = setup().await;
        transition(&pool, job.id, JobStatus::Queued, JobStatus::Running, None).await.unwrap();
        let now = Utc::now().timestamp_millis();

        assert_eq!(list_resumable(&pool, now).await.unwrap().len(), 1);

        acquire_lease(&pool, job.id, "worker-a", 60_000).await.unwrap();
        assert!(list_resumable(&pool, now).await.unwrap().is_empty());
        assert_eq!(list_resumable(&pool, now + 120_000).await.unwrap().len(), 1);
    }
}
