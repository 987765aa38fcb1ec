//! In-memory snapshot of the cascade's lookup data
//!
//! Loaded from the store at the start of a chunk and read synchronously by
//! every deterministic strategy. All keys are normalized.

use std::collections::{BTreeSet, HashMap};

use lexa_common::text::normalize_key;

#[derive(Debug, Clone, PartialEq)]
pub struct LexiconEntry {
    pub classification: Vec<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default)]
pub struct Lexicons {
    cache: HashMap<String, LexiconEntry>,
    regional: HashMap<String, Vec<String>>,
    general: HashMap<String, Vec<(String, LexiconEntry)>>,
    synonyms: HashMap<String, BTreeSet<String>>,
}

impl Lexicons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_cache(&mut self, word: &str, classification: Vec<String>, confidence: f32) {
        self.cache.insert(
            normalize_key(word),
            LexiconEntry {
                classification,
                confidence,
            },
        );
    }

    pub fn insert_regional(&mut self, word: &str, classification: Vec<String>) {
        if !classification.is_empty() {
            self.regional.insert(normalize_key(word), classification);
        }
    }

    pub fn insert_general(&mut self, word: &str, pos: &str, classification: Vec<String>, confidence: f32) {
        let senses = self.general.entry(normalize_key(word)).or_default();
        let pos = pos.trim().to_lowercase();
        senses.retain(|(existing, _)| *existing != pos);
        senses.push((
            pos,
            LexiconEntry {
                classification,
                confidence,
            },
        ));
    }

    /// Undirected synonym edge; self-links are ignored
    pub fn link_synonyms(&mut self, a: &str, b: &str) {
        let (a, b) = (normalize_key(a), normalize_key(b));
        if a.is_empty() || b.is_empty() || a == b {
            return;
        }
        self.synonyms.entry(a.clone()).or_default().insert(b.clone());
        self.synonyms.entry(b).or_default().insert(a);
    }

    pub fn cached(&self, word: &str) -> Option<&LexiconEntry> {
        self.cache.get(word)
    }

    pub fn regional(&self, word: &str) -> Option<&Vec<String>> {
        self.regional.get(word)
    }

    /// General lexicon sense for `pos`, or the most confident sense when
    /// no part of speech is known
    ///
    /// Ties between senses go to the alphabetically first part of speech.
    pub fn general(&self, word: &str, pos: Option<&str>) -> Option<&LexiconEntry> {
        let senses = self.general.get(word)?;
        match pos {
            Some(pos) => {
                let pos = pos.trim().to_lowercase();
                senses.iter().find(|(p, _)| *p == pos).map(|(_, e)| e)
            }
            None => senses
                .iter()
                .min_by(|(pa, a), (pb, b)| {
                    b.confidence
                        .total_cmp(&a.confidence)
                        .then_with(|| pa.cmp(pb))
                })
                .map(|(_, e)| e),
        }
    }

    /// Neighbours in sorted order
    pub fn neighbours(&self, word: &str) -> impl Iterator<Item = &String> {
        self.synonyms.get(word).into_iter().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
            && self.regional.is_empty()
            && self.general.is_empty()
            && self.synonyms.is_empty()
    }
}
