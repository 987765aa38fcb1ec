//! Cascade evaluation
//!
//! [`Cascade`] runs the five deterministic strategies synchronously over a
//! [`Lexicons`] snapshot. [`CascadeResolver`] adds the generative fallback
//! for whatever the local strategies leave pending, batching those words.

use std::collections::{BTreeSet, HashSet};

use lexa_common::config::{AffixPosition, CascadeConfig};
use lexa_common::text::normalize_key;
use tracing::{debug, trace, warn};

use super::generative::{ClassifyRequest, GenerativeFallback};
use super::lexicons::Lexicons;
use super::{Resolution, ResolutionResult, Strategy, WordContext};

#[derive(Debug, Clone)]
struct AffixRule {
    affix: String,
    position: AffixPosition,
    classification: Option<Vec<String>>,
    confidence: f32,
    min_stem_len: usize,
    restore_endings: Vec<String>,
}

impl AffixRule {
    fn stem<'a>(&self, word: &'a str) -> Option<&'a str> {
        let stem = match self.position {
            AffixPosition::Suffix => word.strip_suffix(self.affix.as_str())?,
            AffixPosition::Prefix => word.strip_prefix(self.affix.as_str())?,
        };
        (stem.chars().count() >= self.min_stem_len).then_some(stem)
    }
}

/// Outcome of the deterministic strategies for one word
#[derive(Debug, Clone, PartialEq)]
pub enum LocalResolution {
    /// A strategy reached the threshold
    Accepted(ResolutionResult),
    /// Nothing at or above the prior result's rank hit; the accepted prior stands
    Kept(ResolutionResult),
    /// Needs the generative fallback
    Pending {
        /// Most confident sub-threshold candidate from strategies 1-5
        best: Option<ResolutionResult>,
        /// Accepted prior generative result, if any
        prior: Option<ResolutionResult>,
    },
}

/// Deterministic strategies 1-5
pub struct Cascade {
    lexicons: Lexicons,
    acceptance_threshold: f32,
    propagation_discount: f32,
    max_propagation_hops: usize,
    regional_confidence: f32,
    rules: Vec<AffixRule>,
}

impl Cascade {
    pub fn new(lexicons: Lexicons, config: &CascadeConfig) -> Self {
        let rules = config
            .affix_rules
            .iter()
            .filter_map(|rule| {
                let affix = normalize_key(&rule.affix);
                if affix.is_empty() {
                    warn!(affix = %rule.affix, "Ignoring affix rule with empty affix");
                    return None;
                }
                Some(AffixRule {
                    affix,
                    position: rule.position,
                    classification: rule.classification.clone(),
                    confidence: rule.confidence.clamp(0.0, 1.0),
                    min_stem_len: rule.min_stem_len,
                    restore_endings: rule.restore_endings.iter().map(|e| normalize_key(e)).collect(),
                })
            })
            .collect();

        Self {
            lexicons,
            acceptance_threshold: config.acceptance_threshold,
            propagation_discount: config.propagation_discount.clamp(0.0, 1.0),
            max_propagation_hops: config.max_propagation_hops,
            regional_confidence: config.regional_confidence.clamp(0.0, 1.0),
            rules,
        }
    }

    pub fn lexicons(&self) -> &Lexicons {
        &self.lexicons
    }

    pub fn accepts(&self, result: &ResolutionResult) -> bool {
        result.confidence >= self.acceptance_threshold
    }

    /// Result of a single deterministic strategy, ignoring the threshold
    pub fn lookup(&self, strategy: Strategy, word: &str, context: &WordContext) -> Option<ResolutionResult> {
        match strategy {
            Strategy::Cache => self.lexicons.cached(word).map(|entry| {
                ResolutionResult::new(word, entry.classification.clone(), entry.confidence, Strategy::Cache)
            }),
            Strategy::RegionalLexicon => self.lexicons.regional(word).map(|classification| {
                ResolutionResult::new(
                    word,
                    classification.clone(),
                    self.regional_confidence,
                    Strategy::RegionalLexicon,
                )
            }),
            Strategy::Propagation => self.propagate(word),
            Strategy::GeneralLexicon => self
                .lexicons
                .general(word, context.part_of_speech.as_deref())
                .map(|entry| {
                    ResolutionResult::new(
                        word,
                        entry.classification.clone(),
                        entry.confidence,
                        Strategy::GeneralLexicon,
                    )
                }),
            Strategy::Morphology => self.morphology(word),
            Strategy::Generative => None,
        }
    }

    /// Run strategies 1-5 in order, never past the rank of `prior`
    ///
    /// A prior below the acceptance threshold is no resolution and is ignored.
    pub fn resolve_local(
        &self,
        word: &str,
        context: &WordContext,
        prior: Option<&ResolutionResult>,
    ) -> LocalResolution {
        let prior = prior.filter(|p| self.accepts(p));
        let ceiling = prior.map(|p| p.strategy.rank()).unwrap_or(Strategy::Generative.rank());
        let mut best: Option<ResolutionResult> = None;

        for strategy in Strategy::LOCAL {
            if strategy.rank() > ceiling {
                break;
            }
            let Some(candidate) = self.lookup(strategy, word, context) else {
                continue;
            };
            if self.accepts(&candidate) {
                trace!(word, strategy = %strategy, confidence = candidate.confidence, "Accepted");
                return LocalResolution::Accepted(candidate);
            }
            if best.as_ref().map_or(true, |b| candidate.confidence > b.confidence) {
                best = Some(candidate);
            }
        }

        match prior {
            Some(p) if p.strategy != Strategy::Generative => LocalResolution::Kept(p.clone()),
            _ => LocalResolution::Pending {
                best,
                prior: prior.cloned(),
            },
        }
    }

    /// Strategies 1-2 at or above the threshold, used for propagation sources
    fn direct(&self, word: &str) -> Option<ResolutionResult> {
        let context = WordContext::default();
        [Strategy::Cache, Strategy::RegionalLexicon]
            .into_iter()
            .filter_map(|s| self.lookup(s, word, &context))
            .find(|r| self.accepts(r))
    }

    /// Breadth-first search for the nearest directly resolved synonym
    ///
    /// Nearer neighbours always win. Among neighbours at the same depth the
    /// most confident wins, then the lexicographically smallest key.
    fn propagate(&self, word: &str) -> Option<ResolutionResult> {
        let mut visited: HashSet<String> = HashSet::from([word.to_string()]);
        let mut frontier: BTreeSet<String> = BTreeSet::from([word.to_string()]);

        for depth in 1..=self.max_propagation_hops {
            let next: BTreeSet<String> = frontier
                .iter()
                .flat_map(|w| self.lexicons.neighbours(w))
                .filter(|n| !visited.contains(n.as_str()))
                .cloned()
                .collect();
            if next.is_empty() {
                return None;
            }
            visited.extend(next.iter().cloned());

            let mut found: Option<(String, ResolutionResult)> = None;
            for neighbour in &next {
                if let Some(source) = self.direct(neighbour) {
                    // `next` iterates in key order, so strict > keeps the smallest key on ties
                    if found.as_ref().map_or(true, |(_, f)| source.confidence > f.confidence) {
                        found = Some((neighbour.clone(), source));
                    }
                }
            }

            if let Some((via, source)) = found {
                let confidence = source.confidence * self.propagation_discount.powi(depth as i32);
                debug!(word, via = %via, depth, confidence, "Resolved through synonym graph");
                return Some(
                    ResolutionResult::new(word, source.classification, confidence, Strategy::Propagation)
                        .propagated(),
                );
            }
            frontier = next;
        }

        None
    }

    /// Affix rules; the most confident applicable rule wins, earlier rules on ties
    fn morphology(&self, word: &str) -> Option<ResolutionResult> {
        let mut best: Option<ResolutionResult> = None;

        for rule in &self.rules {
            let Some(stem) = rule.stem(word) else {
                continue;
            };

            let candidate = match &rule.classification {
                Some(fixed) => Some(ResolutionResult::new(
                    word,
                    fixed.clone(),
                    rule.confidence,
                    Strategy::Morphology,
                )),
                None => std::iter::once(stem.to_string())
                    .chain(rule.restore_endings.iter().map(|e| format!("{}{}", stem, e)))
                    .find_map(|base| self.stem_resolution(&base))
                    .map(|base| {
                        ResolutionResult::new(
                            word,
                            base.classification,
                            base.confidence * rule.confidence,
                            Strategy::Morphology,
                        )
                    }),
            };

            if let Some(candidate) = candidate {
                if best.as_ref().map_or(true, |b| candidate.confidence > b.confidence) {
                    best = Some(candidate);
                }
            }
        }

        best
    }

    /// Direct lexicon knowledge about a stem: cache, regional, then general
    fn stem_resolution(&self, stem: &str) -> Option<ResolutionResult> {
        let context = WordContext::default();
        [Strategy::Cache, Strategy::RegionalLexicon, Strategy::GeneralLexicon]
            .into_iter()
            .find_map(|s| self.lookup(s, stem, &context))
    }
}

/// One unit handed to [`CascadeResolver::resolve_batch`]
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Normalized word
    pub word: String,
    pub context: WordContext,
    /// Machine-generated result from an earlier run
    pub prior: Option<ResolutionResult>,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// One resolution per input item, in order
    pub resolutions: Vec<Resolution>,
    /// Items whose generative call failed and fell back
    pub generative_failures: u64,
}

/// Full six-strategy cascade
pub struct CascadeResolver {
    cascade: Cascade,
    generative: Option<GenerativeFallback>,
    batch_size: usize,
}

impl CascadeResolver {
    pub fn new(cascade: Cascade, generative: Option<GenerativeFallback>, batch_size: usize) -> Self {
        Self {
            cascade,
            generative,
            batch_size: batch_size.max(1),
        }
    }

    pub fn cascade(&self) -> &Cascade {
        &self.cascade
    }

    /// Resolve one word
    pub async fn resolve(
        &self,
        word: &str,
        context: &WordContext,
        prior: Option<&ResolutionResult>,
    ) -> Resolution {
        let item = BatchItem {
            word: word.to_string(),
            context: context.clone(),
            prior: prior.cloned(),
        };
        self.resolve_batch(std::slice::from_ref(&item))
            .await
            .resolutions
            .pop()
            .unwrap_or(Resolution::Unresolved)
    }

    /// Resolve many words, sending the ones strategies 1-5 miss to the
    /// classifier in batches of `batch_size`
    ///
    /// A failed classifier batch never fails the call: each of its items
    /// keeps its accepted prior result or ends unresolved, so the next run
    /// asks the classifier again.
    pub async fn resolve_batch(&self, items: &[BatchItem]) -> BatchOutcome {
        let mut resolutions: Vec<Resolution> = vec![Resolution::Unresolved; items.len()];
        let mut pending: Vec<(usize, Option<ResolutionResult>)> = Vec::new();

        for (i, item) in items.iter().enumerate() {
            match self.cascade.resolve_local(&item.word, &item.context, item.prior.as_ref()) {
                LocalResolution::Accepted(result) | LocalResolution::Kept(result) => {
                    resolutions[i] = Resolution::Resolved(result);
                }
                LocalResolution::Pending { prior, .. } => pending.push((i, prior)),
            }
        }

        let mut outcome = BatchOutcome {
            resolutions,
            generative_failures: 0,
        };

        let Some(generative) = &self.generative else {
            for (i, prior) in pending {
                if let Some(prior) = prior {
                    outcome.resolutions[i] = Resolution::Resolved(prior);
                }
            }
            return outcome;
        };

        for group in pending.chunks(self.batch_size) {
            let requests: Vec<ClassifyRequest> = group
                .iter()
                .map(|(i, _)| ClassifyRequest {
                    word: items[*i].word.clone(),
                    context: items[*i].context.text.clone(),
                })
                .collect();

            match generative.classify(&requests).await {
                Ok(answers) => {
                    for ((i, prior), answer) in group.iter().zip(answers) {
                        let candidate = answer.map(|a| {
                            ResolutionResult::new(
                                &items[*i].word,
                                a.classification,
                                a.confidence,
                                Strategy::Generative,
                            )
                        });
                        outcome.resolutions[*i] = match (candidate, prior) {
                            (Some(c), _) if self.cascade.accepts(&c) => Resolution::Resolved(c),
                            (_, Some(prior)) => Resolution::Resolved(prior.clone()),
                            _ => Resolution::Unresolved,
                        };
                    }
                }
                Err(e) => {
                    warn!(
                        batch = group.len(),
                        error = %e,
                        "Generative classifier unavailable, keeping prior results"
                    );
                    outcome.generative_failures += group.len() as u64;
                    for (i, prior) in group {
                        outcome.resolutions[*i] = match prior {
                            Some(result) => Resolution::Resolved(result.clone()),
                            None => Resolution::Unresolved,
                        };
                    }
                }
            }
        }

        outcome
    }
}
