//! Configuration resolution for lexa-ingest
//!
//! The classifier API key is resolved Database → ENV → TOML. A key found
//! only in the environment is migrated into the database (and backed up to
//! TOML) so later restarts see a single authoritative source.

use lexa_common::config::TomlConfig;
use lexa_common::Result;
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{info, warn};

/// Environment variable holding the classifier API key
pub const CLASSIFIER_API_KEY_ENV: &str = "LEXA_CLASSIFIER_API_KEY";

/// Where a resolved key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Database,
    Environment,
    Toml,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySource::Database => "database",
            KeySource::Environment => "environment",
            KeySource::Toml => "TOML",
        }
    }
}

/// Resolve the classifier API key
///
/// **Priority:** Database → ENV → TOML. `None` when no source holds a
/// usable key; the classifier then calls without authentication.
pub async fn resolve_classifier_api_key(
    db: &Pool<Sqlite>,
    toml_config: &TomlConfig,
) -> Result<Option<(String, KeySource)>> {
    let db_key = crate::db::settings::get_classifier_api_key(db)
        .await?
        .filter(|k| is_valid_key(k));
    let env_key = std::env::var(CLASSIFIER_API_KEY_ENV)
        .ok()
        .filter(|k| is_valid_key(k));
    let toml_key = toml_config
        .classifier
        .api_key
        .clone()
        .filter(|k| is_valid_key(k));

    let candidates = [
        (db_key, KeySource::Database),
        (env_key, KeySource::Environment),
        (toml_key, KeySource::Toml),
    ];

    let present: Vec<&str> = candidates
        .iter()
        .filter(|(key, _)| key.is_some())
        .map(|(_, source)| source.as_str())
        .collect();
    if present.len() > 1 {
        warn!(
            "Classifier API key found in multiple sources: {}. Using {} (highest priority).",
            present.join(", "),
            present[0]
        );
    }

    let resolved = candidates
        .into_iter()
        .find_map(|(key, source)| key.map(|k| (k, source)));
    match &resolved {
        Some((_, source)) => info!("Classifier API key loaded from {}", source.as_str()),
        None => info!("No classifier API key configured"),
    }
    Ok(resolved)
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Store the classifier key in the TOML file, keeping every other setting
///
/// Best effort: a failed write is logged, since the database already holds
/// the key.
pub fn sync_api_key_to_toml(key: &str, toml_path: &Path) -> Result<()> {
    let mut config = lexa_common::config::load_toml_config(Some(toml_path))?;
    config.classifier.api_key = Some(key.to_string());

    match lexa_common::config::write_toml_config(&config, toml_path) {
        Ok(()) => {
            info!("Settings synced to TOML: {}", toml_path.display());
            Ok(())
        }
        Err(e) => {
            warn!("TOML write failed (database write succeeded): {}", e);
            Ok(())
        }
    }
}

/// Copy a key resolved from ENV/TOML into the database
///
/// An environment key is also backed up to TOML.
pub async fn migrate_key_to_database(
    key: &str,
    source: KeySource,
    db: &Pool<Sqlite>,
    toml_path: Option<&Path>,
) -> Result<()> {
    if source == KeySource::Database {
        return Ok(());
    }

    crate::db::settings::set_classifier_api_key(db, key.to_string()).await?;

    if let (KeySource::Environment, Some(path)) = (source, toml_path) {
        sync_api_key_to_toml(key, path)?;
    }

    info!("Classifier API key migrated from {} to database", source.as_str());
    Ok(())
}
