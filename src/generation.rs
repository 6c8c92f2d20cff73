use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::capabilities::{CallLimiter, GenerationContext, TextGenerator};
use crate::config::RetryPolicy;
use crate::constants::collaborators::GENERATOR;
use crate::constants::generation::{CANDIDATE_ID_HEX_LEN, CANDIDATE_ID_PREFIX};
use crate::data::{Candidate, LabeledExample, Pattern, RunWarning};
use crate::errors::PipelineError;
use crate::filter::leakage_marker;
use crate::hash::{fingerprint_with, update_part, update_u64};
use crate::types::{CandidateId, Detail, Label};
use crate::utils::normalize_inline_whitespace;

/// Candidates and non-fatal events produced for one seed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationOutcome {
    /// Usable candidates, in slot order.
    pub candidates: Vec<Candidate>,
    /// Slots that exhausted their attempts.
    pub warnings: Vec<RunWarning>,
}

/// Drives generation calls for one seed at a time with bounded retries.
pub struct CandidateGenerator {
    generator: Arc<dyn TextGenerator>,
    retry: RetryPolicy,
    run_seed: u64,
    limiter: Arc<CallLimiter>,
}

impl CandidateGenerator {
    /// Generator issuing one call at a time; ids are derived from `run_seed`.
    pub fn new(generator: Arc<dyn TextGenerator>, retry: RetryPolicy, run_seed: u64) -> Self {
        Self {
            generator,
            retry,
            run_seed,
            limiter: Arc::new(CallLimiter::default()),
        }
    }

    /// Share `limiter` with other collaborator callers.
    pub fn with_limiter(mut self, limiter: Arc<CallLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Generate up to `num_candidates` counterfactuals of `seed` toward `target_label`.
    ///
    /// Slot `i` is guided by `patterns[i % patterns.len()]`; with no patterns every
    /// slot is a general edit. Exhausted slots become `GenerationFailure` warnings.
    /// Returns an error only when the generator reports itself unavailable.
    pub fn generate(
        &self,
        seed: &LabeledExample,
        target_label: &str,
        patterns: &[Pattern],
        num_candidates: usize,
    ) -> Result<GenerationOutcome, PipelineError> {
        if target_label == seed.label {
            return Err(PipelineError::SameLabel(target_label.to_string()));
        }
        let mut outcome = GenerationOutcome::default();
        for slot in 0..num_candidates {
            let pattern = (!patterns.is_empty()).then(|| &patterns[slot % patterns.len()]);
            match self.generate_slot(seed, target_label, pattern, slot)? {
                Ok(candidate) => outcome.candidates.push(candidate),
                Err(warning) => outcome.warnings.push(warning),
            }
        }
        Ok(outcome)
    }

    fn generate_slot(
        &self,
        seed: &LabeledExample,
        target_label: &str,
        pattern: Option<&Pattern>,
        slot: usize,
    ) -> Result<Result<Candidate, RunWarning>, PipelineError> {
        let attempts = self.retry.max_attempts();
        let mut last_problem: Detail = String::new();

        for attempt in 0..attempts {
            let backoff = self.retry.backoff_before(attempt);
            if !backoff.is_zero() {
                thread::sleep(backoff);
            }
            let context = GenerationContext {
                seed_text: seed.text.clone(),
                original_label: seed.label.clone(),
                target_label: target_label.to_string(),
                pattern: pattern.cloned(),
                slot,
                attempt,
            };
            let generator = Arc::clone(&self.generator);
            let result = self
                .limiter
                .call(self.retry.timeout(), move || generator.generate(&context));
            let text = match result {
                Ok(text) => text.trim().to_string(),
                Err(err) if err.is_fatal() => return Err(err.into_pipeline(GENERATOR)),
                Err(err) => {
                    debug!(
                        "[counterfactuals:generate] seed '{}' slot {slot} attempt {attempt} failed: {err}",
                        seed.id
                    );
                    last_problem = err.to_string();
                    continue;
                }
            };
            if let Some(problem) = unusable_output(&text, &seed.text) {
                debug!(
                    "[counterfactuals:generate] seed '{}' slot {slot} attempt {attempt} unusable: {problem}",
                    seed.id
                );
                last_problem = problem;
                continue;
            }
            let candidate = Candidate::new(
                candidate_id(&seed.id, target_label, slot, self.run_seed),
                seed,
                target_label.to_string(),
                pattern.map(|p| p.id.clone()),
                text,
                attempt,
                slot,
            )?;
            return Ok(Ok(candidate));
        }

        warn!(
            "[counterfactuals:generate] seed '{}' slot {slot} exhausted {attempts} attempts: {last_problem}",
            seed.id
        );
        Ok(Err(RunWarning::GenerationFailure {
            seed_id: seed.id.clone(),
            target_label: target_label.to_string(),
            slot,
            attempts,
            detail: last_problem,
        }))
    }
}

/// Reason a raw generation must be retried, if any.
fn unusable_output(text: &str, seed_text: &str) -> Option<Detail> {
    if text.is_empty() {
        return Some("empty output".to_string());
    }
    if normalize_inline_whitespace(text) == normalize_inline_whitespace(seed_text) {
        return Some("output identical to seed".to_string());
    }
    leakage_marker(text).map(|marker| format!("prompt leakage ({marker})"))
}

/// Stable candidate identifier for a (seed, target, slot, run seed) tuple.
pub fn candidate_id(seed_id: &str, target_label: &str, slot: usize, run_seed: u64) -> CandidateId {
    let digest = fingerprint_with(|hasher| {
        update_part(hasher, seed_id);
        update_part(hasher, target_label);
        update_u64(hasher, slot as u64);
        update_u64(hasher, run_seed);
    });
    format!("{CANDIDATE_ID_PREFIX}{}", &digest[..CANDIDATE_ID_HEX_LEN])
}

/// Target label for a seed: the next declared label after `original`, wrapping.
///
/// Binary label sets therefore swap. Returns `None` when `original` is not
/// declared or fewer than two labels exist.
pub fn target_label_for(original: &str, labels: &[Label]) -> Option<Label> {
    if labels.len() < 2 {
        return None;
    }
    let position = labels.iter().position(|label| label == original)?;
    Some(labels[(position + 1) % labels.len()].clone())
}
