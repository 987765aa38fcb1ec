//! Unit processors, one per job kind
//!
//! A processor turns a source into the staged unit sequence once, and later
//! turns each chunk of that sequence into output rows. Chunk work is split in
//! two so nothing slow happens while the chunk's write transaction is open:
//!
//! 1. [`UnitProcessor::prepare`] reads whatever it needs and computes the
//!    rows (cascade lookups, classifier calls).
//! 2. [`PreparedChunk::commit`] writes them inside the transaction that also
//!    carries the checkpoint.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use lexa_common::config::CascadeConfig;
use lexa_common::jobs::JobKind;
use lexa_common::text::{normalize_key, tokenize};
use lexa_common::Result;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::cascade::{
    BatchItem, Cascade, CascadeResolver, Classifier, GenerativeFallback, Resolution,
    ResolutionResult, WordContext,
};
use crate::db::{annotations, entries, lexicon, SqliteClassificationCache};
use crate::models::{ChunkTally, JobMetadata, SourceReference, Unit, WordOccurrence};
use crate::parser::{
    BlockParser, EntryFormat, HeadwordFormat, ParsedEntry, SongHeaderFormat, DEFAULT_MIN_FRAGMENT_LEN,
    PARSER_VERSION,
};
use crate::resilience::{CircuitBreaker, RetryPolicy};

/// Result of parsing a job's source
#[derive(Debug, Default)]
pub struct StagedUnits {
    pub units: Vec<Unit>,
    pub metadata: JobMetadata,
}

/// One output row
#[derive(Debug, Clone, PartialEq)]
pub enum UnitWrite {
    Entry(ParsedEntry),
    Annotation {
        unit_key: String,
        result: ResolutionResult,
    },
}

/// Output of a chunk, computed but not yet written
#[derive(Debug, Default)]
pub struct PreparedChunk {
    pub writes: Vec<UnitWrite>,
    /// Counters known before writing; `inserted` is filled by [`commit`](Self::commit)
    pub tally: ChunkTally,
    /// Stored machine annotations below this confidence are replaceable by
    /// any strategy
    pub replace_below: f32,
}

impl PreparedChunk {
    /// Write every row on `conn` and return the chunk's final tally
    ///
    /// All writes are upserts by natural key, so committing the same chunk
    /// twice leaves the same rows.
    pub async fn commit(&self, conn: &mut SqliteConnection, job_id: Uuid) -> Result<ChunkTally> {
        let mut tally = self.tally.clone();

        for write in &self.writes {
            match write {
                UnitWrite::Entry(entry) => {
                    if entries::upsert(&mut *conn, entry, job_id).await? {
                        tally.inserted += 1;
                    } else {
                        tally.skipped_writes += 1;
                    }
                }
                UnitWrite::Annotation { unit_key, result } => {
                    if annotations::upsert(&mut *conn, unit_key, result, job_id, self.replace_below).await? {
                        tally.inserted += 1;
                    } else {
                        tally.skipped_writes += 1;
                    }
                }
            }
        }

        Ok(tally)
    }
}

#[async_trait]
pub trait UnitProcessor: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Parse the whole source into units (blocking; run off the async runtime)
    fn stage(&self, source: &SourceReference) -> Result<StagedUnits>;

    /// Compute the rows for `units`
    async fn prepare(&self, db: &SqlitePool, units: &[Unit]) -> Result<PreparedChunk>;
}

fn parse_source<F: EntryFormat>(
    source: &SourceReference,
    format: F,
    min_fragment_len: usize,
) -> Result<(Vec<ParsedEntry>, JobMetadata)> {
    let mut parser = BlockParser::new(source.open()?, format).with_min_fragment_len(min_fragment_len);
    let parsed: Vec<ParsedEntry> = parser.by_ref().collect();
    let stats = parser.stats();

    if let Some(e) = &stats.io_error {
        return Err(lexa_common::Error::Io(std::io::Error::other(format!(
            "Reading {} failed after {} lines: {}",
            source.describe(),
            stats.lines,
            e
        ))));
    }

    let metadata = JobMetadata {
        parser_version: Some(PARSER_VERSION.to_string()),
        source_format: Some(parser.format_name().to_string()),
        rejected_entries: stats.rejected,
        ..Default::default()
    };
    debug!(
        source = %source.describe(),
        emitted = stats.emitted,
        rejected = stats.rejected,
        noise_lines = stats.noise_lines,
        orphan_lines = stats.orphan_lines,
        "Source parsed"
    );

    Ok((parsed, metadata))
}

/// `dictionary-import`: one unit per dictionary entry
#[derive(Debug, Default, Clone, Copy)]
pub struct DictionaryImportProcessor;

#[async_trait]
impl UnitProcessor for DictionaryImportProcessor {
    fn kind(&self) -> JobKind {
        JobKind::DictionaryImport
    }

    fn stage(&self, source: &SourceReference) -> Result<StagedUnits> {
        let (parsed, metadata) = parse_source(source, HeadwordFormat, DEFAULT_MIN_FRAGMENT_LEN)?;
        Ok(StagedUnits {
            units: parsed.into_iter().map(Unit::Entry).collect(),
            metadata,
        })
    }

    async fn prepare(&self, _db: &SqlitePool, units: &[Unit]) -> Result<PreparedChunk> {
        let mut prepared = PreparedChunk::default();
        prepared.tally.processed = units.len() as u64;

        for unit in units {
            match unit {
                Unit::Entry(entry) => prepared.writes.push(UnitWrite::Entry(entry.clone())),
                Unit::Occurrence(other) => {
                    return Err(lexa_common::Error::Internal(format!(
                        "Unexpected occurrence {} in a dictionary import",
                        other.unit_key
                    )))
                }
            }
        }

        Ok(prepared)
    }
}

/// Generative fallback dependencies shared by every chunk
#[derive(Clone)]
pub struct GenerativeDeps {
    pub classifier: Arc<dyn Classifier>,
    pub breaker: Arc<CircuitBreaker>,
    pub retry: RetryPolicy,
}

/// `corpus-annotate`: one unit per word occurrence in a lyrics corpus
pub struct CorpusAnnotateProcessor {
    config: CascadeConfig,
    generative: Option<GenerativeDeps>,
}

impl CorpusAnnotateProcessor {
    pub fn new(config: CascadeConfig, generative: Option<GenerativeDeps>) -> Self {
        Self { config, generative }
    }

    /// Split songs into word occurrences
    fn occurrences(songs: Vec<ParsedEntry>) -> Vec<Unit> {
        let mut units = Vec::new();
        let mut seen_songs: HashSet<String> = HashSet::new();

        for song in songs {
            // Repeated titles would collide on unit keys
            let mut slug = song.key.replace(' ', "-");
            let mut n = 2;
            while !seen_songs.insert(slug.clone()) {
                slug = format!("{}-{}", song.key.replace(' ', "-"), n);
                n += 1;
            }

            for (line_no, line) in song.fragments.iter().enumerate() {
                for (token_no, token) in tokenize(line).into_iter().enumerate() {
                    let word = normalize_key(&token);
                    if word.is_empty() {
                        continue;
                    }
                    units.push(Unit::Occurrence(WordOccurrence {
                        unit_key: WordOccurrence::unit_key(&slug, line_no, token_no),
                        surface: token,
                        word,
                        context: line.clone(),
                        part_of_speech: None,
                    }));
                }
            }
        }

        units
    }

    fn resolver(&self, db: &SqlitePool, cascade: Cascade) -> CascadeResolver {
        let fallback = self.generative.as_ref().map(|deps| {
            GenerativeFallback::new(
                deps.classifier.clone(),
                Arc::new(SqliteClassificationCache::new(db.clone())),
                deps.breaker.clone(),
                deps.retry,
            )
        });
        CascadeResolver::new(cascade, fallback, self.config.generative_batch_size)
    }
}

#[async_trait]
impl UnitProcessor for CorpusAnnotateProcessor {
    fn kind(&self) -> JobKind {
        JobKind::CorpusAnnotate
    }

    fn stage(&self, source: &SourceReference) -> Result<StagedUnits> {
        // "Oh" and "Ai" are whole lyric lines
        let (songs, metadata) = parse_source(source, SongHeaderFormat, 1)?;
        Ok(StagedUnits {
            units: Self::occurrences(songs),
            metadata,
        })
    }

    async fn prepare(&self, db: &SqlitePool, units: &[Unit]) -> Result<PreparedChunk> {
        let occurrences: Vec<&WordOccurrence> = units
            .iter()
            .map(|unit| match unit {
                Unit::Occurrence(occurrence) => Ok(occurrence),
                Unit::Entry(entry) => Err(lexa_common::Error::Internal(format!(
                    "Unexpected dictionary entry {} in a corpus annotation",
                    entry.key
                ))),
            })
            .collect::<Result<_>>()?;

        let lexicons = lexicon::load_lexicons(db).await?;
        let resolver = self.resolver(db, Cascade::new(lexicons, &self.config));

        let keys: Vec<String> = occurrences.iter().map(|o| o.unit_key.clone()).collect();
        let existing = annotations::load_existing(db, &keys).await?;

        let mut prepared = PreparedChunk {
            replace_below: self.config.acceptance_threshold,
            ..Default::default()
        };
        prepared.tally.processed = units.len() as u64;

        let mut items = Vec::with_capacity(occurrences.len());
        let mut item_keys = Vec::with_capacity(occurrences.len());
        for occurrence in &occurrences {
            let stored = existing.get(&occurrence.unit_key);
            if stored.is_some_and(|s| s.curated) {
                prepared.tally.skipped_writes += 1;
                continue;
            }

            let mut context = WordContext::new(occurrence.context.as_str());
            if let Some(pos) = &occurrence.part_of_speech {
                context = context.with_part_of_speech(pos.as_str());
            }
            items.push(BatchItem {
                word: occurrence.word.clone(),
                context,
                prior: stored.map(|s| s.result.clone()),
            });
            item_keys.push(occurrence.unit_key.clone());
        }

        let outcome = resolver.resolve_batch(&items).await;
        prepared.tally.errors = outcome.generative_failures;

        for (unit_key, resolution) in item_keys.into_iter().zip(outcome.resolutions) {
            match resolution {
                Resolution::Resolved(result) => {
                    prepared.tally.record_strategy(result.strategy.as_str());
                    prepared.writes.push(UnitWrite::Annotation { unit_key, result });
                }
                Resolution::Unresolved => prepared.tally.unresolved += 1,
            }
        }

        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::generative::tests::ScriptedClassifier;
    use crate::cascade::Strategy;
    use crate::resilience::CircuitBreakerConfig;
    use lexa_common::db::init_memory_database;

    const CORPUS: &str = "# Águas de Março\nÉ pau, é pedra\nÉ o fim do caminho\n\n# Vazia\n\n# Sabiá\nVou voltar\n";

    #[test]
    fn test_corpus_stages_one_unit_per_token() {
        let staged = CorpusAnnotateProcessor::new(CascadeConfig::default(), None)
            .stage(&SourceReference::Inline(CORPUS.to_string()))
            .unwrap();

        // 4 + 5 + 2 tokens; the song without lyrics is rejected
        assert_eq!(staged.units.len(), 11);
        assert_eq!(staged.metadata.rejected_entries, 1);
        assert_eq!(staged.metadata.source_format.as_deref(), Some("song-header"));

        let Unit::Occurrence(first) = &staged.units[0] else {
            panic!("expected occurrence");
        };
        assert_eq!(first.unit_key, "aguas-de-marco:0:0");
        assert_eq!(first.surface, "É");
        assert_eq!(first.word, "e");
        assert_eq!(first.context, "É pau, é pedra");
    }

    #[test]
    fn test_repeated_song_titles_get_distinct_keys() {
        let units = CorpusAnnotateProcessor::occurrences(vec![
            ParsedEntry {
                key: "refrao".into(),
                headword: "Refrão".into(),
                fragments: vec!["lá lá".into()],
                category: None,
                cross_refs: vec![],
            },
            ParsedEntry {
                key: "refrao".into(),
                headword: "Refrão".into(),
                fragments: vec!["lá".into()],
                category: None,
                cross_refs: vec![],
            },
        ]);
        let keys: Vec<&str> = units
            .iter()
            .map(|u| match u {
                Unit::Occurrence(o) => o.unit_key.as_str(),
                Unit::Entry(_) => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec!["refrao:0:0", "refrao:0:1", "refrao-2:0:0"]);
    }

    #[test]
    fn test_dictionary_stage_records_parser_metadata() {
        let staged = DictionaryImportProcessor
            .stage(&SourceReference::Inline(
                "*alpha*,\nDefinition one.\n\n*beta*,\nDef two.\nMore text.\n\n*gamma*,\n".to_string(),
            ))
            .unwrap();
        assert_eq!(staged.units.len(), 2);
        assert_eq!(staged.metadata.rejected_entries, 1);
        assert_eq!(staged.metadata.parser_version.as_deref(), Some(PARSER_VERSION));
    }

    #[tokio::test]
    async fn test_prepare_resolves_and_counts_unresolved() {
        let db = init_memory_database().await.unwrap();
        lexicon::upsert_cache_entry(&db, "pedra", &["objeto".to_string()], 0.95).await.unwrap();

        let processor = CorpusAnnotateProcessor::new(CascadeConfig::default(), None);
        let staged = processor
            .stage(&SourceReference::Inline("# Canção\npedra lisa\n".to_string()))
            .unwrap();

        let prepared = processor.prepare(&db, &staged.units).await.unwrap();
        assert_eq!(prepared.tally.processed, 2);
        assert_eq!(prepared.tally.unresolved, 1);
        assert_eq!(prepared.tally.strategy_breakdown["cache"], 1);
        assert_eq!(prepared.writes.len(), 1);

        let mut conn = db.acquire().await.unwrap();
        let tally = prepared.commit(&mut conn, Uuid::new_v4()).await.unwrap();
        assert_eq!(tally.inserted, 1);
    }

    #[tokio::test]
    async fn test_prepare_skips_curated_and_counts_classifier_failures() {
        let db = init_memory_database().await.unwrap();
        let classifier = Arc::new(ScriptedClassifier::new(&[]).failing(100));
        let processor = CorpusAnnotateProcessor::new(
            CascadeConfig::default(),
            Some(GenerativeDeps {
                classifier,
                breaker: Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::relaxed())),
                retry: RetryPolicy::no_retry(),
            }),
        );
        let staged = processor
            .stage(&SourceReference::Inline("# Canção\npedra lisa\n".to_string()))
            .unwrap();

        // curate the first occurrence
        let mut conn = db.acquire().await.unwrap();
        let curated = ResolutionResult::new("pedra", vec!["mineral".into()], 1.0, Strategy::Cache);
        annotations::upsert(&mut conn, "cancao:0:0", &curated, Uuid::new_v4(), 0.6).await.unwrap();
        drop(conn);
        annotations::mark_curated(&db, "cancao:0:0").await.unwrap();

        let prepared = processor.prepare(&db, &staged.units).await.unwrap();
        assert_eq!(prepared.tally.skipped_writes, 1);
        assert_eq!(prepared.tally.errors, 1);
        assert_eq!(prepared.tally.unresolved, 1);
        assert!(prepared.writes.is_empty());
    }

    #[test]
    fn test_short_lyric_lines_are_staged() {
        let staged = CorpusAnnotateProcessor::new(CascadeConfig::default(), None)
            .stage(&SourceReference::Inline("# Lamento\nAi\nmeu bem\n".to_string()))
            .unwrap();

        assert_eq!(staged.units.len(), 3);
        let Unit::Occurrence(first) = &staged.units[0] else {
            panic!("expected occurrence");
        };
        assert_eq!(first.word, "ai");
        assert_eq!(first.context, "Ai");
    }

    #[tokio::test]
    async fn test_homographs_in_one_dump_count_one_insert() {
        let db = init_memory_database().await.unwrap();
        let staged = DictionaryImportProcessor
            .stage(&SourceReference::Inline(
                "*manga*,\nFruto da mangueira.\n\n*manga*,\nParte da roupa.\n\n*caju*,\nFruto do cajueiro.\n"
                    .to_string(),
            ))
            .unwrap();
        assert_eq!(staged.units.len(), 3);

        let prepared = DictionaryImportProcessor.prepare(&db, &staged.units).await.unwrap();
        let mut conn = db.acquire().await.unwrap();
        let tally = prepared.commit(&mut conn, Uuid::new_v4()).await.unwrap();
        drop(conn);

        assert_eq!(tally.inserted, 2);
        assert_eq!(tally.skipped_writes, 1);
        assert_eq!(entries::count(&db).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_classifier_outage_leaves_word_for_the_next_run() {
        let db = init_memory_database().await.unwrap();
        lexicon::upsert_general(&db, "brisa", "noun", &["vento".to_string()], 0.4).await.unwrap();
        let classifier = Arc::new(ScriptedClassifier::new(&[("brisa", "brisa-marinha", 0.9)]).failing(1));
        let processor = CorpusAnnotateProcessor::new(
            CascadeConfig::default(),
            Some(GenerativeDeps {
                classifier: classifier.clone(),
                breaker: Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::relaxed())),
                retry: RetryPolicy::no_retry(),
            }),
        );
        let staged = processor
            .stage(&SourceReference::Inline("# Mar\nbrisa\n".to_string()))
            .unwrap();

        let outage = processor.prepare(&db, &staged.units).await.unwrap();
        assert_eq!(outage.tally.errors, 1);
        assert_eq!(outage.tally.unresolved, 1);
        assert!(outage.writes.is_empty());

        let recovered = processor.prepare(&db, &staged.units).await.unwrap();
        let mut conn = db.acquire().await.unwrap();
        recovered.commit(&mut conn, Uuid::new_v4()).await.unwrap();
        drop(conn);

        let stored = annotations::get(&db, "mar:0:0").await.unwrap().unwrap();
        assert_eq!(stored.result.strategy, Strategy::Generative);
        assert_eq!(stored.result.classification, vec!["brisa-marinha"]);
        assert_eq!(classifier.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_weak_stored_annotation_is_replaced_by_classifier() {
        let db = init_memory_database().await.unwrap();
        let classifier = Arc::new(ScriptedClassifier::new(&[("brisa", "brisa-marinha", 0.9)]));
        let processor = CorpusAnnotateProcessor::new(
            CascadeConfig::default(),
            Some(GenerativeDeps {
                classifier,
                breaker: Arc::new(CircuitBreaker::new("test", CircuitBreakerConfig::relaxed())),
                retry: RetryPolicy::no_retry(),
            }),
        );
        let staged = processor
            .stage(&SourceReference::Inline("# Mar\nbrisa\n".to_string()))
            .unwrap();

        // left behind by an older run
        let mut conn = db.acquire().await.unwrap();
        let weak = ResolutionResult::new("brisa", vec!["vento".into()], 0.4, Strategy::GeneralLexicon);
        annotations::upsert(&mut conn, "mar:0:0", &weak, Uuid::new_v4(), 0.0).await.unwrap();
        drop(conn);

        let prepared = processor.prepare(&db, &staged.units).await.unwrap();
        let mut conn = db.acquire().await.unwrap();
        let tally = prepared.commit(&mut conn, Uuid::new_v4()).await.unwrap();
        drop(conn);

        assert_eq!(tally.inserted, 1);
        let stored = annotations::get(&db, "mar:0:0").await.unwrap().unwrap();
        assert_eq!(stored.result.strategy, Strategy::Generative);
    }
}
