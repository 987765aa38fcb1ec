//! Tiered resolution cascade
//!
//! Six strategies ordered from cheapest and most trusted to most expensive:
//!
//! | rank | strategy           | source                                    |
//! |------|--------------------|-------------------------------------------|
//! | 1    | `cache`            | curated exact-match cache                 |
//! | 2    | `regional_lexicon` | imported dictionary entries with category |
//! | 3    | `propagation`      | synonym graph, BFS to a rank 1-2 neighbour|
//! | 4    | `general_lexicon`  | general lexicon keyed by part of speech   |
//! | 5    | `morphology`       | productive affix rules                    |
//! | 6    | `generative`       | external classifier, batched and cached   |
//!
//! The first strategy whose confidence reaches the acceptance threshold wins.
//! A result of rank `k` is never replaced by a result of rank greater than
//! `k` unless it was invalidated first.

pub mod generative;
pub mod lexicons;
pub mod resolver;

use std::fmt;
use std::str::FromStr;

use lexa_common::Error;
use serde::{Deserialize, Serialize};

pub use generative::{
    Classification, ClassificationCache, Classifier, ClassifierError, ClassifyRequest,
    GenerativeFallback, HttpClassifier, CLASSIFIER_DEPENDENCY,
};
pub use lexicons::{LexiconEntry, Lexicons};
pub use resolver::{BatchOutcome, BatchItem, Cascade, CascadeResolver, LocalResolution};

/// Resolution strategy, ordered by rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Cache,
    RegionalLexicon,
    Propagation,
    GeneralLexicon,
    Morphology,
    Generative,
}

impl Strategy {
    /// Deterministic strategies, in cascade order
    pub const LOCAL: [Strategy; 5] = [
        Strategy::Cache,
        Strategy::RegionalLexicon,
        Strategy::Propagation,
        Strategy::GeneralLexicon,
        Strategy::Morphology,
    ];

    /// 1 (cheapest, most trusted) to 6
    pub fn rank(&self) -> u8 {
        match self {
            Strategy::Cache => 1,
            Strategy::RegionalLexicon => 2,
            Strategy::Propagation => 3,
            Strategy::GeneralLexicon => 4,
            Strategy::Morphology => 5,
            Strategy::Generative => 6,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Strategy> {
        match rank {
            1 => Some(Strategy::Cache),
            2 => Some(Strategy::RegionalLexicon),
            3 => Some(Strategy::Propagation),
            4 => Some(Strategy::GeneralLexicon),
            5 => Some(Strategy::Morphology),
            6 => Some(Strategy::Generative),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Cache => "cache",
            Strategy::RegionalLexicon => "regional_lexicon",
            Strategy::Propagation => "propagation",
            Strategy::GeneralLexicon => "general_lexicon",
            Strategy::Morphology => "morphology",
            Strategy::Generative => "generative",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache" => Ok(Strategy::Cache),
            "regional_lexicon" => Ok(Strategy::RegionalLexicon),
            "propagation" => Ok(Strategy::Propagation),
            "general_lexicon" => Ok(Strategy::GeneralLexicon),
            "morphology" => Ok(Strategy::Morphology),
            "generative" => Ok(Strategy::Generative),
            other => Err(Error::InvalidInput(format!("Unknown strategy: {}", other))),
        }
    }
}

/// Cascade output for one unit
///
/// Serialized shape is consumed by curation tooling and must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub key: String,
    pub classification: Vec<String>,
    pub confidence: f32,
    pub strategy: Strategy,
    pub is_propagated: bool,
}

impl ResolutionResult {
    pub fn new(key: &str, classification: Vec<String>, confidence: f32, strategy: Strategy) -> Self {
        Self {
            key: key.to_string(),
            classification,
            confidence: confidence.clamp(0.0, 1.0),
            strategy,
            is_propagated: false,
        }
    }

    pub fn propagated(mut self) -> Self {
        self.is_propagated = true;
        self
    }
}

/// Outcome of resolving one unit
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolutionResult),
    /// No strategy reached the threshold; not an error
    Unresolved,
}

impl Resolution {
    pub fn result(&self) -> Option<&ResolutionResult> {
        match self {
            Resolution::Resolved(result) => Some(result),
            Resolution::Unresolved => None,
        }
    }
}

/// Where a word occurs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WordContext {
    /// Surrounding text (a lyric line)
    pub text: String,
    pub part_of_speech: Option<String>,
}

impl WordContext {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            part_of_speech: None,
        }
    }

    pub fn with_part_of_speech(mut self, pos: impl Into<String>) -> Self {
        self.part_of_speech = Some(pos.into());
        self
    }
}
