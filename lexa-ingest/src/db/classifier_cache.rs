//! SQLite-backed cache of generative classifier answers

use async_trait::async_trait;
use chrono::Utc;
use lexa_common::Result;
use sqlx::SqlitePool;

use crate::cascade::{Classification, ClassificationCache};

#[derive(Clone)]
pub struct SqliteClassificationCache {
    db: SqlitePool,
}

impl SqliteClassificationCache {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ClassificationCache for SqliteClassificationCache {
    async fn get(&self, word: &str, context_hash: &str) -> Result<Option<Option<Classification>>> {
        let row: Option<(Option<String>, Option<f64>)> = sqlx::query_as(
            "SELECT classification, confidence FROM classifier_cache WHERE word = ? AND context_hash = ?",
        )
        .bind(word)
        .bind(context_hash)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some((Some(classification), Some(confidence))) => Ok(Some(Some(Classification {
                classification: serde_json::from_str(&classification)?,
                confidence: confidence as f32,
            }))),
            Some(_) => Ok(Some(None)),
            None => Ok(None),
        }
    }

    async fn put(&self, word: &str, context_hash: &str, classification: Option<&Classification>) -> Result<()> {
        let labels = classification
            .map(|c| serde_json::to_string(&c.classification))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO classifier_cache (word, context_hash, classification, confidence, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(word, context_hash) DO UPDATE SET
                classification = excluded.classification,
                confidence = excluded.confidence
            "#,
        )
        .bind(word)
        .bind(context_hash)
        .bind(labels)
        .bind(classification.map(|c| c.confidence as f64))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
