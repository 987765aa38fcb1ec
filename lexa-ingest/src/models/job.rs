//! Job record and its satellites
//!
//! The persisted [`Job`] is the only state shared between chunk invocations.
//! `cursor` is the index of the next unit to process and always equals
//! `processed_count` as of the last committed checkpoint.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use lexa_common::jobs::{JobKind, JobStatus};
use lexa_common::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a job's source text comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceReference {
    /// File on the worker's filesystem
    Path(PathBuf),
    /// Text supplied with the request
    Inline(String),
}

impl SourceReference {
    /// Reject references that cannot possibly produce units
    pub fn validate(&self) -> Result<()> {
        match self {
            SourceReference::Path(path) => {
                let meta = std::fs::metadata(path).map_err(|e| {
                    Error::InvalidInput(format!("Source {} is not readable: {}", path.display(), e))
                })?;
                if !meta.is_file() {
                    return Err(Error::InvalidInput(format!(
                        "Source {} is not a regular file",
                        path.display()
                    )));
                }
                Ok(())
            }
            SourceReference::Inline(text) => {
                if text.trim().is_empty() {
                    Err(Error::InvalidInput("Inline source is empty".to_string()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Open the source as a buffered line stream
    pub fn open(&self) -> Result<Box<dyn BufRead + Send>> {
        match self {
            SourceReference::Path(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
            SourceReference::Inline(text) => Ok(Box::new(Cursor::new(text.clone().into_bytes()))),
        }
    }

    /// Short description for logs and metadata
    pub fn describe(&self) -> String {
        match self {
            SourceReference::Path(path) => path.display().to_string(),
            SourceReference::Inline(text) => format!("inline ({} bytes)", text.len()),
        }
    }
}

/// Structured part of the job's free-form metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_format: Option<String>,
    /// Entries the parser dropped while staging
    #[serde(default)]
    pub rejected_entries: u64,
    /// Units resolved per cascade strategy
    #[serde(default)]
    pub strategy_breakdown: BTreeMap<String, u64>,
    /// Writes skipped because a curated or higher-ranked result exists
    #[serde(default)]
    pub skipped_writes: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobMetadata {
    pub fn absorb(&mut self, tally: &ChunkTally) {
        for (strategy, count) in &tally.strategy_breakdown {
            *self.strategy_breakdown.entry(strategy.clone()).or_insert(0) += count;
        }
        self.skipped_writes += tally.skipped_writes;
    }
}

/// Persisted job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub source: SourceReference,
    pub total_units: u64,
    pub processed_count: u64,
    pub inserted_count: u64,
    pub unresolved_count: u64,
    pub error_count: u64,
    pub cursor: u64,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    /// Causal message of a failure, or a human-readable outcome
    pub message: Option<String>,
    pub metadata: JobMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(kind: JobKind, source: SourceReference, total_units: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Queued,
            source,
            total_units,
            processed_count: 0,
            inserted_count: 0,
            unresolved_count: 0,
            error_count: 0,
            cursor: 0,
            cancel_requested: false,
            cancel_reason: None,
            message: None,
            metadata: JobMetadata::default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.total_units
    }

    /// Percentage complete (0.0 - 100.0)
    pub fn progress_percent(&self) -> f64 {
        if self.total_units == 0 {
            100.0
        } else {
            (self.processed_count as f64 / self.total_units as f64) * 100.0
        }
    }
}

/// Aggregate outcome of one chunk, committed together with the checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkTally {
    /// Units consumed (advances the cursor)
    pub processed: u64,
    /// Output rows written
    pub inserted: u64,
    pub unresolved: u64,
    /// Units whose processing degraded (e.g. classifier failure)
    pub errors: u64,
    pub skipped_writes: u64,
    pub strategy_breakdown: BTreeMap<String, u64>,
}

impl ChunkTally {
    pub fn record_strategy(&mut self, strategy: &str) {
        *self.strategy_breakdown.entry(strategy.to_string()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_source_reference_wire_format() {
        let json = serde_json::to_value(SourceReference::Inline("x".into())).unwrap();
        assert_eq!(json, serde_json::json!({ "inline": "x" }));

        let parsed: SourceReference =
            serde_json::from_value(serde_json::json!({ "path": "/tmp/dict.txt" })).unwrap();
        assert_eq!(parsed, SourceReference::Path(PathBuf::from("/tmp/dict.txt")));
    }

    #[test]
    fn test_validate_rejects_missing_file_and_blank_text() {
        assert!(SourceReference::Path(PathBuf::from("/definitely/not/here.txt"))
            .validate()
            .is_err());
        assert!(SourceReference::Inline("  \n ".into()).validate().is_err());
        assert!(SourceReference::Inline("*a*,\nbody".into()).validate().is_ok());
    }

    #[test]
    fn test_open_reads_file_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "*mar*,").unwrap();
        writeln!(file, "Massa de água salgada.").unwrap();

        let source = SourceReference::Path(file.path().to_path_buf());
        source.validate().unwrap();
        let lines: Vec<String> = source.open().unwrap().lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec!["*mar*,", "Massa de água salgada."]);
    }

    #[test]
    fn test_metadata_keeps_unknown_fields() {
        let raw = serde_json::json!({ "rejected_entries": 2, "operator": "night-batch" });
        let metadata: JobMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(metadata.rejected_entries, 2);
        assert_eq!(metadata.extra["operator"], "night-batch");

        let back = serde_json::to_value(&metadata).unwrap();
        assert_eq!(back["operator"], "night-batch");
    }

    #[test]
    fn test_metadata_absorbs_tally() {
        let mut metadata = JobMetadata::default();
        let mut tally = ChunkTally::default();
        tally.record_strategy("cache");
        tally.record_strategy("cache");
        tally.record_strategy("morphology");
        tally.skipped_writes = 1;

        metadata.absorb(&tally);
        metadata.absorb(&tally);
        assert_eq!(metadata.strategy_breakdown["cache"], 4);
        assert_eq!(metadata.strategy_breakdown["morphology"], 2);
        assert_eq!(metadata.skipped_writes, 2);
    }
}
