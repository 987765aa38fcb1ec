//! Cascade lookup data
//!
//! Classifications are stored as JSON arrays of labels.

use lexa_common::text::normalize_key;
use lexa_common::Result;
use sqlx::{SqliteConnection, SqlitePool};

use crate::cascade::Lexicons;

fn decode_labels(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(labels) => labels,
        // Tolerate hand-seeded plain-text labels
        Err(_) => vec![raw.trim().to_string()],
    }
}

/// Snapshot every lookup table into memory
///
/// The regional lexicon is the set of imported dictionary entries that carry
/// a category.
pub async fn load_lexicons(pool: &SqlitePool) -> Result<Lexicons> {
    let mut lexicons = Lexicons::new();

    let cache: Vec<(String, String, f64)> =
        sqlx::query_as("SELECT word, classification, confidence FROM resolution_cache")
            .fetch_all(pool)
            .await?;
    for (word, classification, confidence) in cache {
        lexicons.insert_cache(&word, decode_labels(&classification), confidence as f32);
    }

    let regional: Vec<(String, String)> = sqlx::query_as(
        "SELECT key, category FROM dictionary_entries WHERE category IS NOT NULL AND category != ''",
    )
    .fetch_all(pool)
    .await?;
    for (key, category) in regional {
        lexicons.insert_regional(&key, vec![category]);
    }

    let general: Vec<(String, String, String, f64)> =
        sqlx::query_as("SELECT word, pos, classification, confidence FROM general_lexicon")
            .fetch_all(pool)
            .await?;
    for (word, pos, classification, confidence) in general {
        lexicons.insert_general(&word, &pos, decode_labels(&classification), confidence as f32);
    }

    let synonyms: Vec<(String, String)> = sqlx::query_as("SELECT word, synonym FROM synonyms")
        .fetch_all(pool)
        .await?;
    for (a, b) in synonyms {
        lexicons.link_synonyms(&a, &b);
    }

    Ok(lexicons)
}

pub async fn upsert_cache_entry(
    pool: &SqlitePool,
    word: &str,
    classification: &[String],
    confidence: f32,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO resolution_cache (word, classification, confidence, updated_at)
        VALUES (?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(word) DO UPDATE SET
            classification = excluded.classification,
            confidence = excluded.confidence,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(normalize_key(word))
    .bind(serde_json::to_string(classification)?)
    .bind(confidence as f64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_general(
    pool: &SqlitePool,
    word: &str,
    pos: &str,
    classification: &[String],
    confidence: f32,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO general_lexicon (word, pos, classification, confidence)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(word, pos) DO UPDATE SET
            classification = excluded.classification,
            confidence = excluded.confidence
        "#,
    )
    .bind(normalize_key(word))
    .bind(pos.trim().to_lowercase())
    .bind(serde_json::to_string(classification)?)
    .bind(confidence as f64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Store an undirected synonym edge once, in canonical order
pub async fn insert_synonym(conn: &mut SqliteConnection, a: &str, b: &str) -> Result<()> {
    let (a, b) = (normalize_key(a), normalize_key(b));
    if a.is_empty() || b.is_empty() || a == b {
        return Ok(());
    }
    let (first, second) = if a < b { (a, b) } else { (b, a) };

    sqlx::query("INSERT OR IGNORE INTO synonyms (word, synonym) VALUES (?, ?)")
        .bind(first)
        .bind(second)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
