use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::filter::{
    DEFAULT_C2_THRESHOLD, DEFAULT_C3_THRESHOLD, DEFAULT_MAX_CHARS, DEFAULT_MIN_CHARS,
    DEFAULT_MIN_LATIN_SHARE,
};
use crate::constants::generation::{
    DEFAULT_BACKOFF_MS, DEFAULT_CALL_TIMEOUT_MS, DEFAULT_CONCURRENCY, DEFAULT_NUM_CANDIDATES,
    DEFAULT_RETRIES, MAX_CONCURRENCY,
};
use crate::constants::patterns::{
    MAX_LEARNING_EXAMPLES, MAX_PATTERNS_PER_LABEL, MIN_LEARNING_EXAMPLES,
};
use crate::constants::selection::{
    DEFAULT_DIVERSITY_COS_MAX, DEFAULT_SEED, DEFAULT_TARGET_K, DEFAULT_WEIGHT_C2,
    DEFAULT_WEIGHT_FLIP, DEFAULT_WEIGHT_SOFT,
};
use crate::errors::PipelineError;
use crate::types::Label;

/// Weights combining gate scores into the selection composite.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeWeights {
    /// Weight of the C2 pattern score (N/A counts as 1.0).
    pub c2: f32,
    /// Weight of the C3 primary flip score.
    pub flip: f32,
    /// Weight of the C3 soft flip score.
    pub soft: f32,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            c2: DEFAULT_WEIGHT_C2,
            flip: DEFAULT_WEIGHT_FLIP,
            soft: DEFAULT_WEIGHT_SOFT,
        }
    }
}

impl CompositeWeights {
    fn validate(&self) -> Result<(), PipelineError> {
        let all = [self.c2, self.flip, self.soft];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PipelineError::Configuration(
                "composite weights must be finite and non-negative".to_string(),
            ));
        }
        if all.iter().sum::<f32>() <= 0.0 {
            return Err(PipelineError::Configuration(
                "composite weights must not all be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Thresholds and bounds for the three quality gates.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum C2 pattern-match score.
    pub c2_threshold: f32,
    /// Minimum C3 primary flip score.
    pub c3_threshold: f32,
    /// Minimum trimmed length in characters.
    pub min_chars: usize,
    /// Maximum length in characters.
    pub max_chars: usize,
    /// Minimum share of alphabetic characters in Latin script.
    pub min_latin_share: f32,
    /// Ask the scorer for C2 and C3 in one call when it supports batching.
    pub batched_scoring: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            c2_threshold: DEFAULT_C2_THRESHOLD,
            c3_threshold: DEFAULT_C3_THRESHOLD,
            min_chars: DEFAULT_MIN_CHARS,
            max_chars: DEFAULT_MAX_CHARS,
            min_latin_share: DEFAULT_MIN_LATIN_SHARE,
            batched_scoring: false,
        }
    }
}

/// Bounded-attempt policy for unreliable collaborator calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Linear backoff step between attempts in milliseconds (0 disables sleeping).
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRIES,
            timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed per slot.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sleep applied before attempt `attempt` (zero for the first attempt).
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Candidate generation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Candidate slots requested per seed.
    pub num_candidates: usize,
    /// Retry and timeout policy for each slot.
    pub retry: RetryPolicy,
    /// Concurrent in-flight collaborator calls.
    pub concurrency: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            num_candidates: DEFAULT_NUM_CANDIDATES,
            retry: RetryPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl GenerationConfig {
    /// Concurrency clamped to the supported range.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }
}

/// Pattern learning and cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Patterns kept per label after ranking.
    pub max_patterns_per_label: usize,
    /// Examples handed to the learner per label.
    pub max_learning_examples: usize,
    /// Labels with fewer examples get no patterns.
    pub min_learning_examples: usize,
    /// Ignore cached entries and relearn.
    pub force_relearn: bool,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            max_patterns_per_label: MAX_PATTERNS_PER_LABEL,
            max_learning_examples: MAX_LEARNING_EXAMPLES,
            min_learning_examples: MIN_LEARNING_EXAMPLES,
            force_relearn: false,
        }
    }
}

/// Relative share of the demonstration budget assigned to a label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelTarget {
    /// Declared label.
    pub label: Label,
    /// Relative share of `target_k` (non-negative).
    pub weight: f32,
}

impl LabelTarget {
    /// Target for `label` with `weight`.
    pub fn new(label: impl Into<Label>, weight: f32) -> Self {
        Self {
            label: label.into(),
            weight,
        }
    }

    /// Equal-weight targets in declaration order.
    pub fn uniform(labels: &[Label]) -> Vec<Self> {
        labels
            .iter()
            .map(|label| Self::new(label.clone(), 1.0))
            .collect()
    }
}

/// Demonstration selection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Maximum number of demonstrations.
    pub target_k: usize,
    /// Admitted members must have pairwise similarity strictly below this.
    pub diversity_cos_max: f32,
    /// Seed for exact-tie breaking.
    pub seed: u64,
    /// Composite score weights.
    pub weights: CompositeWeights,
    /// Per-label weights in declaration order; empty means equal weights over declared labels.
    pub label_targets: Vec<LabelTarget>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            target_k: DEFAULT_TARGET_K,
            diversity_cos_max: DEFAULT_DIVERSITY_COS_MAX,
            seed: DEFAULT_SEED,
            weights: CompositeWeights::default(),
            label_targets: Vec::new(),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Declared labels in declaration order.
    pub labels: Vec<Label>,
    /// Quality gate settings.
    pub filter: FilterConfig,
    /// Generation settings.
    pub generation: GenerationConfig,
    /// Pattern learning settings.
    pub patterns: PatternConfig,
    /// Selection settings.
    pub selection: SelectionConfig,
    /// Directory receiving the DemoSet artifact; `None` skips persistence.
    pub output_dir: Option<PathBuf>,
}

impl PipelineConfig {
    /// Validate ranges and label declarations.
    pub fn validated(self) -> Result<Self, PipelineError> {
        if self.labels.len() < 2 {
            return Err(PipelineError::Configuration(
                "at least two labels must be declared".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for label in &self.labels {
            if label.trim().is_empty() {
                return Err(PipelineError::Configuration(
                    "labels must not be empty".to_string(),
                ));
            }
            if !seen.insert(label.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "label '{label}' declared more than once"
                )));
            }
        }
        for (name, value) in [
            ("c2_threshold", self.filter.c2_threshold),
            ("c3_threshold", self.filter.c3_threshold),
            ("min_latin_share", self.filter.min_latin_share),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Configuration(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.filter.max_chars <= self.filter.min_chars {
            return Err(PipelineError::Configuration(
                "max_chars must exceed min_chars".to_string(),
            ));
        }
        let cap = self.selection.diversity_cos_max;
        if !(cap > 0.0 && cap <= 1.0) {
            return Err(PipelineError::Configuration(format!(
                "diversity_cos_max must be within (0, 1], got {cap}"
            )));
        }
        self.selection.weights.validate()?;
        for target in &self.selection.label_targets {
            if !target.weight.is_finite() || target.weight < 0.0 {
                return Err(PipelineError::Configuration(format!(
                    "label target weight for '{}' must be finite and non-negative",
                    target.label
                )));
            }
            if !seen.contains(target.label.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "label target '{}' is not a declared label",
                    target.label
                )));
            }
        }
        if self.generation.num_candidates == 0 {
            return Err(PipelineError::Configuration(
                "num_candidates must be at least 1".to_string(),
            ));
        }
        if self.generation.concurrency == 0 {
            return Err(PipelineError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }

    /// Label targets to use for selection (explicit, or equal over declared labels).
    pub fn resolved_label_targets(&self) -> Vec<LabelTarget> {
        if self.selection.label_targets.is_empty() {
            LabelTarget::uniform(&self.labels)
        } else {
            self.selection.label_targets.clone()
        }
    }
}
