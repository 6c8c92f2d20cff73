//! Pairwise text similarity used by the diversity constraint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::capabilities::{CallLimiter, TextEmbedder};
use crate::constants::collaborators::EMBEDDER;
use crate::errors::PipelineError;
use crate::utils::term_counts;

/// Precomputed representation of one text.
#[derive(Clone, Debug, PartialEq)]
pub enum TextVector {
    /// L2-normalised term-frequency weights.
    Sparse(HashMap<String, f32>),
    /// Dense embedding.
    Dense(Vec<f32>),
}

impl TextVector {
    /// Build a normalised term-frequency vector for `text`.
    pub fn term_frequency(text: &str) -> Self {
        let counts = term_counts(text);
        let norm = counts
            .values()
            .map(|count| (*count as f32).powi(2))
            .sum::<f32>()
            .sqrt();
        let weights = counts
            .into_iter()
            .map(|(term, count)| {
                let weight = if norm > 0.0 { count as f32 / norm } else { 0.0 };
                (term, weight)
            })
            .collect();
        TextVector::Sparse(weights)
    }

    /// Cosine similarity in [-1, 1]; mismatched kinds and empty vectors score 0.
    pub fn cosine(&self, other: &TextVector) -> f32 {
        match (self, other) {
            (TextVector::Sparse(a), TextVector::Sparse(b)) => {
                let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
                let dot: f32 = small
                    .iter()
                    .filter_map(|(term, weight)| large.get(term).map(|other| weight * other))
                    .sum();
                dot.clamp(-1.0, 1.0)
            }
            (TextVector::Dense(a), TextVector::Dense(b)) => cosine_similarity(a, b),
            _ => 0.0,
        }
    }
}

/// Cosine similarity between two dense vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

/// Strategy for turning texts into comparable vectors.
pub trait TextSimilarity: Send + Sync {
    /// Short name recorded in logs.
    fn name(&self) -> &'static str;

    /// One vector per input text, in input order.
    fn vectorize(&self, texts: &[String]) -> Result<Vec<TextVector>, PipelineError>;

    /// Similarity between two texts.
    fn similarity(&self, a: &str, b: &str) -> Result<f32, PipelineError> {
        let vectors = self.vectorize(&[a.to_string(), b.to_string()])?;
        Ok(vectors[0].cosine(&vectors[1]))
    }
}

/// Term-frequency cosine over lowercase alphanumeric tokens.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenCosine;

impl TextSimilarity for TokenCosine {
    fn name(&self) -> &'static str {
        "token_cosine"
    }

    fn vectorize(&self, texts: &[String]) -> Result<Vec<TextVector>, PipelineError> {
        Ok(texts
            .iter()
            .map(|text| TextVector::term_frequency(text))
            .collect())
    }
}

/// Cosine over embeddings from an external embedder.
///
/// Falls back to `TokenCosine` for the whole batch when the embedder fails or
/// returns the wrong number of vectors.
pub struct EmbeddingSimilarity {
    embedder: Arc<dyn TextEmbedder>,
    limiter: Arc<CallLimiter>,
    timeout: Duration,
}

impl EmbeddingSimilarity {
    /// Similarity over `embedder` with no call timeout.
    pub fn new(embedder: Arc<dyn TextEmbedder>) -> Self {
        Self {
            embedder,
            limiter: Arc::new(CallLimiter::default()),
            timeout: Duration::ZERO,
        }
    }

    /// Share `limiter` with other collaborator callers.
    pub fn with_limiter(mut self, limiter: Arc<CallLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Bound each embed call by `timeout` (zero disables the bound).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl TextSimilarity for EmbeddingSimilarity {
    fn name(&self) -> &'static str {
        "embedding_cosine"
    }

    fn vectorize(&self, texts: &[String]) -> Result<Vec<TextVector>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embedder = Arc::clone(&self.embedder);
        let owned = texts.to_vec();
        match self.limiter.call(self.timeout, move || embedder.embed(&owned)) {
            Ok(vectors) if vectors.len() == texts.len() => {
                Ok(vectors.into_iter().map(TextVector::Dense).collect())
            }
            Ok(vectors) => {
                warn!(
                    "[counterfactuals:similarity] {EMBEDDER} returned {} vectors for {} texts; using token cosine",
                    vectors.len(),
                    texts.len()
                );
                TokenCosine.vectorize(texts)
            }
            Err(err) => {
                warn!("[counterfactuals:similarity] {EMBEDDER} failed; using token cosine: {err}");
                TokenCosine.vectorize(texts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CapabilityError;

    #[test]
    fn token_cosine_identical_and_disjoint() {
        let same = TokenCosine.similarity("Great food!", "great FOOD").unwrap();
        assert!((same - 1.0).abs() < 1e-6);
        let disjoint = TokenCosine.similarity("great food", "rude waiter").unwrap();
        assert_eq!(disjoint, 0.0);
    }

    #[test]
    fn token_cosine_partial_overlap() {
        let sim = TokenCosine
            .similarity(
                "Affordable lobster with terrible service.",
                "Affordable lobster with reasonable price.",
            )
            .unwrap();
        assert!((sim - 0.6).abs() < 1e-5);
    }

    #[test]
    fn empty_text_scores_zero() {
        assert_eq!(TokenCosine.similarity("", "food").unwrap(), 0.0);
    }

    #[test]
    fn dense_cosine_matches_geometry() {
        let a = TextVector::Dense(vec![1.0, 0.0]);
        let b = TextVector::Dense(vec![0.95, (1.0f32 - 0.95 * 0.95).sqrt()]);
        assert!((a.cosine(&b) - 0.95).abs() < 1e-5);
        assert_eq!(a.cosine(&TextVector::Dense(vec![1.0])), 0.0);
    }

    struct AxisEmbedder;

    impl TextEmbedder for AxisEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
            Ok(texts
                .iter()
                .map(|text| vec![text.len() as f32, 1.0])
                .collect())
        }
    }

    struct BrokenEmbedder;

    impl TextEmbedder for BrokenEmbedder {
        fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
            Err(CapabilityError::Failed("offline".into()))
        }
    }

    #[test]
    fn embedding_similarity_uses_vectors() {
        let similarity = EmbeddingSimilarity::new(Arc::new(AxisEmbedder));
        let vectors = similarity
            .vectorize(&["ab".to_string(), "abcd".to_string()])
            .unwrap();
        assert!(matches!(vectors[0], TextVector::Dense(_)));
    }

    #[test]
    fn embedding_failure_falls_back_to_tokens() {
        let similarity = EmbeddingSimilarity::new(Arc::new(BrokenEmbedder));
        let sim = similarity.similarity("great food", "great food").unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }
}
