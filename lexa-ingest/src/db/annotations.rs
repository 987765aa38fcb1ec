//! Annotation store
//!
//! One row per word occurrence. Machine writes go through a guarded upsert:
//! a curated row is never touched, and a row resolved by a cheaper strategy
//! is never replaced by a more expensive one unless its confidence is below
//! the caller's acceptance floor. [`invalidate`] lifts the second guard for a
//! word by deleting its machine rows.

use std::collections::HashMap;

use chrono::Utc;
use lexa_common::{Error, Result};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::cascade::{ResolutionResult, Strategy};

/// Existing annotation for a unit
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAnnotation {
    pub result: ResolutionResult,
    pub curated: bool,
}

#[derive(sqlx::FromRow)]
struct AnnotationRow {
    unit_key: String,
    word: String,
    classification: String,
    confidence: f64,
    strategy: String,
    is_propagated: bool,
    curated: bool,
}

impl AnnotationRow {
    fn into_stored(self) -> Result<(String, StoredAnnotation)> {
        let classification: Vec<String> = serde_json::from_str(&self.classification)?;
        let strategy: Strategy = self.strategy.parse()?;
        let mut result = ResolutionResult::new(&self.word, classification, self.confidence as f32, strategy);
        result.is_propagated = self.is_propagated;
        Ok((
            self.unit_key,
            StoredAnnotation {
                result,
                curated: self.curated,
            },
        ))
    }
}

/// Write a machine-generated result for `unit_key`
///
/// Returns `false` when the guard kept the existing row (curated, or
/// resolved by a strategy of lower rank with confidence of at least
/// `replace_below`).
pub async fn upsert(
    conn: &mut SqliteConnection,
    unit_key: &str,
    result: &ResolutionResult,
    job_id: Uuid,
    replace_below: f32,
) -> Result<bool> {
    let written = sqlx::query(
        r#"
        INSERT INTO annotations (
            unit_key, word, classification, confidence, strategy, strategy_rank,
            is_propagated, curated, job_id, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        ON CONFLICT(unit_key) DO UPDATE SET
            word = excluded.word,
            classification = excluded.classification,
            confidence = excluded.confidence,
            strategy = excluded.strategy,
            strategy_rank = excluded.strategy_rank,
            is_propagated = excluded.is_propagated,
            job_id = excluded.job_id,
            updated_at = excluded.updated_at
        WHERE annotations.curated = 0
          AND (annotations.strategy_rank >= excluded.strategy_rank OR annotations.confidence < ?)
        "#,
    )
    .bind(unit_key)
    .bind(&result.key)
    .bind(serde_json::to_string(&result.classification)?)
    .bind(result.confidence as f64)
    .bind(result.strategy.as_str())
    .bind(result.strategy.rank() as i64)
    .bind(result.is_propagated)
    .bind(job_id.to_string())
    .bind(Utc::now().to_rfc3339())
    .bind(replace_below as f64)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(written == 1)
}

/// Existing annotations for a set of units
pub async fn load_existing(pool: &SqlitePool, unit_keys: &[String]) -> Result<HashMap<String, StoredAnnotation>> {
    let mut existing = HashMap::new();

    // Bounded IN lists
    for keys in unit_keys.chunks(500) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT unit_key, word, classification, confidence, strategy, is_propagated, curated \
             FROM annotations WHERE unit_key IN (",
        );
        let mut separated = builder.separated(", ");
        for key in keys {
            separated.push_bind(key.as_str());
        }
        separated.push_unseparated(")");

        let rows: Vec<AnnotationRow> = builder.build_query_as().fetch_all(pool).await?;
        for row in rows {
            let (key, stored) = row.into_stored()?;
            existing.insert(key, stored);
        }
    }

    Ok(existing)
}

pub async fn get(pool: &SqlitePool, unit_key: &str) -> Result<Option<StoredAnnotation>> {
    let row: Option<AnnotationRow> = sqlx::query_as(
        "SELECT unit_key, word, classification, confidence, strategy, is_propagated, curated \
         FROM annotations WHERE unit_key = ?",
    )
    .bind(unit_key)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.into_stored().map(|(_, stored)| stored)).transpose()
}

/// Delete the machine-generated annotations of a word
///
/// Curated rows stay. Returns the number of rows removed.
pub async fn invalidate(pool: &SqlitePool, word: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM annotations WHERE word = ? AND curated = 0")
        .bind(word)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Mark a unit's annotation as human-curated
pub async fn mark_curated(pool: &SqlitePool, unit_key: &str) -> Result<()> {
    let result = sqlx::query("UPDATE annotations SET curated = 1, updated_at = ? WHERE unit_key = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(unit_key)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Annotation {} not found", unit_key)));
    }
    Ok(())
}

pub async fn count(pool: &SqlitePool) -> Result<u64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM annotations")
        .fetch_one(pool)
        .await?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexa_common::db::init_memory_database;

    fn result(strategy: Strategy, label: &str) -> ResolutionResult {
        ResolutionResult::new("pedra", vec![label.to_string()], 0.8, strategy)
    }

    async fn write(pool: &SqlitePool, key: &str, r: &ResolutionResult) -> bool {
        let mut conn = pool.acquire().await.unwrap();
        upsert(&mut conn, key, r, Uuid::new_v4(), 0.6).await.unwrap()
    }

    #[tokio::test]
    async fn test_cheaper_strategy_is_never_downgraded() {
        let pool = init_memory_database().await.unwrap();

        assert!(write(&pool, "s:1:0", &result(Strategy::GeneralLexicon, "objeto")).await);
        assert!(!write(&pool, "s:1:0", &result(Strategy::Morphology, "outro")).await);
        // same rank refreshes, better rank replaces
        assert!(write(&pool, "s:1:0", &result(Strategy::GeneralLexicon, "objeto")).await);
        assert!(write(&pool, "s:1:0", &result(Strategy::Cache, "mineral")).await);

        let stored = get(&pool, "s:1:0").await.unwrap().unwrap();
        assert_eq!(stored.result.strategy, Strategy::Cache);
        assert_eq!(stored.result.classification, vec!["mineral"]);
        assert_eq!(count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_weak_row_is_replaceable_by_any_strategy() {
        let pool = init_memory_database().await.unwrap();
        let weak = ResolutionResult::new("brisa", vec!["ar".into()], 0.4, Strategy::GeneralLexicon);
        write(&pool, "s:2:0", &weak).await;

        let answer = ResolutionResult::new("brisa", vec!["vento".into()], 0.9, Strategy::Generative);
        assert!(write(&pool, "s:2:0", &answer).await);
        let stored = get(&pool, "s:2:0").await.unwrap().unwrap();
        assert_eq!(stored.result.strategy, Strategy::Generative);
    }

    #[tokio::test]
    async fn test_curated_rows_are_never_overwritten() {
        let pool = init_memory_database().await.unwrap();
        write(&pool, "s:1:0", &result(Strategy::Generative, "objeto")).await;
        mark_curated(&pool, "s:1:0").await.unwrap();

        assert!(!write(&pool, "s:1:0", &result(Strategy::Cache, "mineral")).await);
        let stored = get(&pool, "s:1:0").await.unwrap().unwrap();
        assert!(stored.curated);
        assert_eq!(stored.result.classification, vec!["objeto"]);

        // invalidation spares curated rows
        assert_eq!(invalidate(&pool, "pedra").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_allows_downgrade() {
        let pool = init_memory_database().await.unwrap();
        write(&pool, "s:1:0", &result(Strategy::RegionalLexicon, "objeto")).await;
        assert_eq!(invalidate(&pool, "pedra").await.unwrap(), 1);
        assert!(write(&pool, "s:1:0", &result(Strategy::Morphology, "outro")).await);
    }

    #[tokio::test]
    async fn test_load_existing_maps_by_unit_key() {
        let pool = init_memory_database().await.unwrap();
        write(&pool, "s:1:0", &result(Strategy::Cache, "a").propagated()).await;
        write(&pool, "s:1:1", &result(Strategy::Morphology, "b")).await;

        let keys = vec!["s:1:0".to_string(), "s:1:1".to_string(), "s:9:9".to_string()];
        let existing = load_existing(&pool, &keys).await.unwrap();
        assert_eq!(existing.len(), 2);
        assert!(existing["s:1:0"].result.is_propagated);
        assert_eq!(existing["s:1:1"].result.strategy, Strategy::Morphology);
    }
}
