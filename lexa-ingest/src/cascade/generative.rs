//! Strategy 6: external generative classifier
//!
//! Words are sent in batches. Every answer is cached by
//! `(word, context_hash)` so a re-run never calls the service again for the
//! same occurrence context. Calls go through the dependency's circuit breaker,
//! which wraps the retry loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lexa_common::config::ClassifierConfig;
use lexa_common::text::context_hash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::resilience::{with_retry_when, CircuitBreaker, CircuitError, RetryPolicy};

/// Breaker/registry name of the classifier dependency
pub const CLASSIFIER_DEPENDENCY: &str = "generative_classifier";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ClassifyRequest {
    pub word: String,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub classification: Vec<String>,
    pub confidence: f32,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Classifier request failed: {0}")]
    Network(String),

    #[error("Classifier returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Classifier response invalid: {0}")]
    InvalidResponse(String),

    #[error("Classifier circuit open, retry in {}ms", remaining.as_millis())]
    CircuitOpen { remaining: Duration },
}

impl ClassifierError {
    /// Network failures, throttling and server errors are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            ClassifierError::Network(_) => true,
            ClassifierError::Status { status, .. } => *status == 429 || *status >= 500,
            ClassifierError::InvalidResponse(_) | ClassifierError::CircuitOpen { .. } => false,
        }
    }
}

/// Batched word classifier
///
/// Returns one answer per request, in request order; `None` means the
/// classifier had no opinion about that word.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify_batch(
        &self,
        requests: &[ClassifyRequest],
    ) -> Result<Vec<Option<Classification>>, ClassifierError>;
}

/// Persistent answers keyed by `(word, context_hash)`
///
/// `get` returns `None` on a miss and `Some(None)` for a stored no-opinion
/// answer.
#[async_trait]
pub trait ClassificationCache: Send + Sync {
    async fn get(&self, word: &str, context_hash: &str) -> lexa_common::Result<Option<Option<Classification>>>;
    async fn put(
        &self,
        word: &str,
        context_hash: &str,
        classification: Option<&Classification>,
    ) -> lexa_common::Result<()>;
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    model: &'a str,
    items: &'a [ClassifyRequest],
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    results: Vec<Option<Classification>>,
}

/// JSON-over-HTTP classifier client
pub struct HttpClassifier {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpClassifier {
    pub fn new(config: &ClassifierConfig, endpoint: String, api_key: Option<String>) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ClassifierError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint,
            model: config.model.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify_batch(
        &self,
        requests: &[ClassifyRequest],
    ) -> Result<Vec<Option<Classification>>, ClassifierError> {
        debug!(batch = requests.len(), endpoint = %self.endpoint, "Calling generative classifier");

        let mut request = self.client.post(&self.endpoint).json(&BatchRequest {
            model: &self.model,
            items: requests,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClassifierError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: BatchResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;

        if parsed.results.len() != requests.len() {
            return Err(ClassifierError::InvalidResponse(format!(
                "expected {} results, got {}",
                requests.len(),
                parsed.results.len()
            )));
        }

        Ok(parsed.results)
    }
}

/// Classifier wrapped with cache, retry and circuit breaker
pub struct GenerativeFallback {
    classifier: Arc<dyn Classifier>,
    cache: Arc<dyn ClassificationCache>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl GenerativeFallback {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        cache: Arc<dyn ClassificationCache>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            classifier,
            cache,
            breaker,
            retry,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Answers for `requests`, in order, serving cached answers first
    ///
    /// Only cache misses reach the classifier, deduplicated by
    /// `(word, context_hash)`. Cache read/write failures degrade to misses
    /// and are logged.
    pub async fn classify(
        &self,
        requests: &[ClassifyRequest],
    ) -> Result<Vec<Option<Classification>>, ClassifierError> {
        let hashes: Vec<String> = requests.iter().map(|r| context_hash(&r.context)).collect();
        let mut answers: Vec<Option<Classification>> = vec![None; requests.len()];
        let mut miss_index: HashMap<(String, String), usize> = HashMap::new();
        let mut misses: Vec<ClassifyRequest> = Vec::new();
        let mut waiting: Vec<(usize, usize)> = Vec::new();

        for (i, request) in requests.iter().enumerate() {
            match self.cache.get(&request.word, &hashes[i]).await {
                Ok(Some(hit)) => {
                    answers[i] = hit;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(word = %request.word, error = %e, "Classifier cache read failed"),
            }

            let key = (request.word.clone(), hashes[i].clone());
            let slot = *miss_index.entry(key).or_insert_with(|| {
                misses.push(request.clone());
                misses.len() - 1
            });
            waiting.push((i, slot));
        }

        if misses.is_empty() {
            return Ok(answers);
        }

        let fetched = self.call_classifier(&misses).await?;

        for (slot, answer) in fetched.iter().enumerate() {
            let hash = context_hash(&misses[slot].context);
            if let Err(e) = self.cache.put(&misses[slot].word, &hash, answer.as_ref()).await {
                warn!(word = %misses[slot].word, error = %e, "Classifier cache write failed");
            }
        }

        for (i, slot) in waiting {
            answers[i] = fetched.get(slot).cloned().flatten();
        }

        Ok(answers)
    }

    async fn call_classifier(
        &self,
        misses: &[ClassifyRequest],
    ) -> Result<Vec<Option<Classification>>, ClassifierError> {
        let classifier = self.classifier.clone();
        let result = self
            .breaker
            .call(|| {
                with_retry_when(
                    CLASSIFIER_DEPENDENCY,
                    &self.retry,
                    || classifier.classify_batch(misses),
                    ClassifierError::is_retryable,
                )
            })
            .await;

        match result {
            Ok(answers) if answers.len() == misses.len() => Ok(answers),
            Ok(answers) => Err(ClassifierError::InvalidResponse(format!(
                "expected {} results, got {}",
                misses.len(),
                answers.len()
            ))),
            Err(CircuitError::Open { remaining, .. }) => Err(ClassifierError::CircuitOpen { remaining }),
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }
}
