//! End-to-end run: patterns → generation → filtering → selection → artifact.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifacts::persist_demo_set;
use crate::audit::{AuditEntry, AuditLog};
use crate::capabilities::{CallLimiter, PatternLearner, TextGenerator, TextScorer};
use crate::config::PipelineConfig;
use crate::data::{DemoSet, EvaluatedCandidate, LabeledExample, Pattern, RejectionReason, RunWarning};
use crate::errors::PipelineError;
use crate::filter::ThreeStageFilter;
use crate::generation::{CandidateGenerator, target_label_for};
use crate::hash::{fingerprint_with, sorted_ids_fingerprint, update_part, update_u64};
use crate::metrics::QualityReport;
use crate::patterns::{LearnedPatterns, PatternCache, PatternOrigin, PatternStore};
use crate::selection::DiversitySelector;
use crate::similarity::{TextSimilarity, TokenCosine};
use crate::types::Label;

/// External collaborators a run calls into.
#[derive(Clone)]
pub struct Collaborators {
    /// Pattern learner.
    pub learner: Arc<dyn PatternLearner>,
    /// Counterfactual generator.
    pub generator: Arc<dyn TextGenerator>,
    /// C2/C3 scorer.
    pub scorer: Arc<dyn TextScorer>,
}

/// Inputs for one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunRequest {
    /// Labeled examples patterns are learned from (and fingerprinted over).
    pub training_examples: Vec<LabeledExample>,
    /// Examples to generate counterfactuals from.
    pub seeds: Vec<LabeledExample>,
}

impl RunRequest {
    /// Use every training example as a seed.
    pub fn new(training_examples: Vec<LabeledExample>) -> Self {
        Self {
            seeds: training_examples.clone(),
            training_examples,
        }
    }

    /// Generate from `seeds` instead of the training set.
    pub fn with_seeds(mut self, seeds: Vec<LabeledExample>) -> Self {
        self.seeds = seeds;
        self
    }
}

/// Counters describing one run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Identifier derived from the run's inputs.
    pub run_id: String,
    /// Seeds with a declared label.
    pub seeds_attempted: usize,
    /// Seeds skipped for an undeclared label.
    pub seeds_skipped: usize,
    /// Candidates that reached the filter.
    pub candidates_generated: usize,
    /// Slots that exhausted their attempts.
    pub generation_failures: usize,
    /// Labels whose learner failed.
    pub learner_failures: usize,
    /// Rejection counts per reason.
    pub rejections: BTreeMap<RejectionReason, usize>,
    /// Candidates passing every gate.
    pub passed: usize,
    /// Passed candidates over generated candidates.
    pub success_rate: f64,
    /// Members in the DemoSet.
    pub selected: usize,
}

/// Everything a run produced.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// Selected demonstrations.
    pub demo_set: DemoSet,
    /// Every generated candidate with its verdict, in seed order.
    pub evaluated: Vec<EvaluatedCandidate>,
    /// Patterns used per declared label.
    pub patterns: Vec<LearnedPatterns>,
    /// Counters for the run.
    pub summary: RunSummary,
    /// Quality metrics over every evaluated candidate.
    pub report: QualityReport,
    /// Where the DemoSet was written, when an output directory is configured.
    pub artifact_path: Option<PathBuf>,
}

/// Per-seed work product.
#[derive(Default)]
struct SeedResult {
    evaluated: Vec<EvaluatedCandidate>,
    warnings: Vec<RunWarning>,
}

/// Orchestrates a full counterfactual run over a bounded worker pool.
pub struct CounterfactualPipeline {
    config: PipelineConfig,
    patterns: PatternStore,
    generator: CandidateGenerator,
    filter: ThreeStageFilter,
    selector: DiversitySelector,
    audit: Option<Arc<dyn AuditLog>>,
    pool: ThreadPool,
}

impl CounterfactualPipeline {
    /// Validate `config` and wire the collaborators together.
    pub fn new(
        config: PipelineConfig,
        collaborators: Collaborators,
        cache: Arc<dyn PatternCache>,
    ) -> Result<Self, PipelineError> {
        let config = config.validated()?;
        let timeout = config.generation.retry.timeout();
        let threads = config.generation.effective_concurrency();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("counterfactuals-worker-{idx}"))
            .build()
            .map_err(|err| {
                PipelineError::Configuration(format!("failed to build worker pool: {err}"))
            })?;
        let limiter = Arc::new(CallLimiter::new(threads));
        let patterns = PatternStore::new(cache, collaborators.learner, config.patterns.clone())
            .with_timeout(timeout)
            .with_limiter(Arc::clone(&limiter));
        let generator = CandidateGenerator::new(
            collaborators.generator,
            config.generation.retry.clone(),
            config.selection.seed,
        )
        .with_limiter(Arc::clone(&limiter));
        let filter = ThreeStageFilter::new(collaborators.scorer, &config.filter)
            .with_timeout(timeout)
            .with_limiter(Arc::clone(&limiter));
        let selector = DiversitySelector::new(Arc::new(TokenCosine), config.selection.clone());
        Ok(Self {
            config,
            patterns,
            generator,
            filter,
            selector,
            audit: None,
            pool,
        })
    }

    /// Replace the default token-cosine similarity.
    pub fn with_similarity(mut self, similarity: Arc<dyn TextSimilarity>) -> Self {
        self.selector = DiversitySelector::new(similarity, self.config.selection.clone());
        self
    }

    /// Append every evaluated candidate to `audit`.
    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validated configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one run.
    ///
    /// Fails only on configuration or persistence errors, or when a collaborator
    /// reports itself unavailable; in that case nothing is persisted.
    pub fn run(&self, request: &RunRequest) -> Result<RunOutcome, PipelineError> {
        let run_id = self.run_id(request);
        let labels = &self.config.labels;
        info!(
            "[counterfactuals:pipeline] run {run_id}: {} training examples, {} seeds, labels {:?}",
            request.training_examples.len(),
            request.seeds.len(),
            labels
        );

        let force_relearn = self.config.patterns.force_relearn;
        let learned: Vec<LearnedPatterns> = self.pool.install(|| {
            labels
                .par_iter()
                .map(|label| {
                    self.patterns
                        .get_or_learn(label, &request.training_examples, force_relearn)
                })
                .collect()
        });

        let mut warnings: Vec<RunWarning> = Vec::new();
        for entry in &learned {
            if let PatternOrigin::LearnerFailed(detail) = &entry.origin {
                warnings.push(RunWarning::LearnerFailure {
                    label: entry.label.clone(),
                    detail: detail.clone(),
                });
            }
        }
        let patterns_by_label: HashMap<&str, &[Pattern]> = learned
            .iter()
            .map(|entry| (entry.label.as_str(), entry.patterns.as_slice()))
            .collect();

        let mut jobs: Vec<(&LabeledExample, Label)> = Vec::with_capacity(request.seeds.len());
        let mut seeds_skipped = 0usize;
        for seed in &request.seeds {
            match target_label_for(&seed.label, labels) {
                Some(target) => jobs.push((seed, target)),
                None => {
                    warn!(
                        "[counterfactuals:pipeline] skipping seed '{}' with undeclared label '{}'",
                        seed.id, seed.label
                    );
                    seeds_skipped += 1;
                    warnings.push(RunWarning::SkippedSeed {
                        seed_id: seed.id.clone(),
                        label: seed.label.clone(),
                    });
                }
            }
        }

        let results: Vec<SeedResult> = self.pool.install(|| {
            jobs.par_iter()
                .map(|(seed, target)| {
                    let patterns = patterns_by_label.get(target.as_str()).copied().unwrap_or(&[]);
                    self.process_seed(&run_id, seed, target, patterns)
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        let mut evaluated = Vec::new();
        for result in results {
            evaluated.extend(result.evaluated);
            warnings.extend(result.warnings);
        }

        let mut demo_set = self
            .selector
            .select(&evaluated, &self.config.resolved_label_targets())?;
        warnings.append(&mut demo_set.warnings);
        demo_set.warnings = warnings;

        let artifact_path = match &self.config.output_dir {
            Some(dir) => Some(persist_demo_set(dir, &demo_set)?),
            None => None,
        };

        let records: Vec<_> = evaluated.iter().map(|entry| entry.record.clone()).collect();
        let report = QualityReport::from_records(&records, &self.config.filter);
        let summary = RunSummary {
            run_id,
            seeds_attempted: jobs.len(),
            seeds_skipped,
            candidates_generated: evaluated.len(),
            generation_failures: demo_set
                .warnings
                .iter()
                .filter(|w| matches!(w, RunWarning::GenerationFailure { .. }))
                .count(),
            learner_failures: demo_set
                .warnings
                .iter()
                .filter(|w| matches!(w, RunWarning::LearnerFailure { .. }))
                .count(),
            rejections: report.rejections.clone(),
            passed: report.passed,
            success_rate: report.pass_rate,
            selected: demo_set.len(),
        };
        info!(
            "[counterfactuals:pipeline] run {}: generated {}, passed {}, selected {}/{}",
            summary.run_id,
            summary.candidates_generated,
            summary.passed,
            summary.selected,
            demo_set.target_k
        );

        Ok(RunOutcome {
            demo_set,
            evaluated,
            patterns: learned,
            summary,
            report,
            artifact_path,
        })
    }

    fn process_seed(
        &self,
        run_id: &str,
        seed: &LabeledExample,
        target: &str,
        patterns: &[Pattern],
    ) -> Result<SeedResult, PipelineError> {
        let generated =
            self.generator
                .generate(seed, target, patterns, self.config.generation.num_candidates)?;
        let mut result = SeedResult {
            warnings: generated.warnings,
            ..SeedResult::default()
        };
        for candidate in generated.candidates {
            let pattern = candidate
                .pattern_id
                .as_ref()
                .and_then(|id| patterns.iter().find(|pattern| &pattern.id == id));
            let record = self.filter.evaluate(&candidate, pattern)?;
            let entry = EvaluatedCandidate { candidate, record };
            if let Some(audit) = &self.audit
                && let Err(err) = audit.append(&AuditEntry::new(run_id, &entry))
            {
                warn!(
                    "[counterfactuals:pipeline] audit append failed for '{}': {err}",
                    entry.candidate.id
                );
            }
            result.evaluated.push(entry);
        }
        Ok(result)
    }

    /// Short identifier derived from the run's inputs and seed.
    fn run_id(&self, request: &RunRequest) -> String {
        let training = sorted_ids_fingerprint(request.training_examples.iter().map(|ex| ex.id.as_str()));
        let seeds = sorted_ids_fingerprint(request.seeds.iter().map(|ex| ex.id.as_str()));
        let digest = fingerprint_with(|hasher| {
            update_part(hasher, &training);
            update_part(hasher, &seeds);
            update_u64(hasher, self.config.selection.seed);
        });
        digest[..16].to_string()
    }
}

