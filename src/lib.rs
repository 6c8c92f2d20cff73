#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Persisted DemoSet artifacts.
pub mod artifacts;
/// Append-only audit log of evaluated candidates.
pub mod audit;
/// Contracts for the learner, generator, scorer, and embedder collaborators.
pub mod capabilities;
/// Pipeline configuration types.
pub mod config;
/// Centralized constants used across filtering, generation, patterns, and selection.
pub mod constants;
/// Examples, patterns, candidates, quality records, and demonstration sets.
pub mod data;
/// Three-stage quality filter.
pub mod filter;
/// Candidate generation with bounded retries.
pub mod generation;
mod hash;
/// Aggregate quality and balance metrics.
pub mod metrics;
/// Content-addressed pattern cache and store.
pub mod patterns;
/// End-to-end run orchestration.
pub mod pipeline;
/// Seeded RNG for reproducible tie-breaking.
pub mod rng;
/// Diversity-constrained, label-balanced demonstration selection.
pub mod selection;
/// Text similarity backends.
pub mod similarity;
/// Filesystem transport helpers.
pub mod transport;
/// Shared type aliases.
pub mod types;
/// Text normalization helpers.
pub mod utils;

mod errors;

pub use artifacts::{list_demo_sets, load_demo_set, persist_demo_set};
pub use audit::{AuditEntry, AuditLog, InMemoryAuditLog, JsonlAuditLog};
pub use capabilities::{
    BatchScores, FlipScores, GenerationContext, PatternLearner, ScoreRequest, TextEmbedder,
    TextGenerator, TextScorer,
};
pub use config::{
    CompositeWeights, FilterConfig, GenerationConfig, LabelTarget, PatternConfig, PipelineConfig,
    RetryPolicy, SelectionConfig,
};
pub use data::{
    C2Score, Candidate, DemoMember, DemoSet, EvaluatedCandidate, LabelCount, LabeledExample,
    Pattern, PatternToken, QualityRecord, RejectionReason, RunWarning,
};
pub use errors::{CapabilityError, PipelineError};
pub use filter::{
    HeuristicGate, LabelFlipGate, PatternConsistencyGate, QualityGate, ThreeStageFilter,
};
pub use generation::{CandidateGenerator, GenerationOutcome, target_label_for};
pub use metrics::{LabelSkew, QualityReport, label_skew};
pub use patterns::{
    CacheKey, FilePatternCache, InMemoryPatternCache, LearnedPatterns, PatternCache,
    PatternOrigin, PatternStore,
};
pub use pipeline::{Collaborators, CounterfactualPipeline, RunOutcome, RunRequest, RunSummary};
pub use rng::DeterministicRng;
pub use selection::{DiversitySelector, allocate_quotas};
pub use similarity::{EmbeddingSimilarity, TextSimilarity, TextVector, TokenCosine};
pub use types::{CandidateId, Detail, ExampleId, Fingerprint, Label, PatternId};
