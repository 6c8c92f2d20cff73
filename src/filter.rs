//! Three ordered quality gates applied to every generated candidate.
//!
//! - C1 `HeuristicGate`: cheap local checks for malformed text.
//! - C2 `PatternConsistencyGate`: the guiding pattern must still hold.
//! - C3 `LabelFlipGate`: the text must now carry the target label.
//!
//! Evaluation stops at the first rejecting gate. Scorer failures score 0;
//! an unavailable scorer aborts with `PipelineError::CollaboratorUnavailable`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::capabilities::{BatchScores, CallLimiter, FlipScores, ScoreRequest, TextScorer};
use crate::config::FilterConfig;
use crate::constants::collaborators::SCORER;
use crate::constants::filter::{
    ELLIPSIS_SUFFIXES, LEAKAGE_PREFIXES, LEAKAGE_TOKENS, REMNANT_TOKENS, REPETITION_MIN_WORDS,
};
use crate::data::{C2Score, Candidate, Pattern, QualityRecord, RejectionReason};
use crate::errors::{CapabilityError, PipelineError};
use crate::types::Detail;
use crate::utils::{is_cjk, latin_share, normalize_inline_whitespace};

/// First instruction or template marker found in `text`, if any.
pub fn leakage_marker(text: &str) -> Option<&'static str> {
    let lowered = text.trim_start().to_lowercase();
    LEAKAGE_PREFIXES
        .iter()
        .find(|prefix| lowered.starts_with(*prefix))
        .or_else(|| LEAKAGE_TOKENS.iter().find(|token| text.contains(*token)))
        .copied()
}

/// Result of a single gate.
#[derive(Clone, Debug, PartialEq)]
pub enum GateVerdict {
    /// Continue to the next gate.
    Pass,
    /// Stop with a rejection.
    Reject {
        /// Reason recorded on the quality record.
        reason: RejectionReason,
        /// What the gate saw.
        detail: Detail,
    },
}

/// What a gate sees about the candidate under evaluation.
#[derive(Clone, Copy, Debug)]
pub struct GateInput<'a> {
    /// Candidate under evaluation.
    pub candidate: &'a Candidate,
    /// Resolved guiding pattern; `None` with `candidate.pattern_id` set means unresolvable.
    pub pattern: Option<&'a Pattern>,
}

/// One stage of the quality filter. Gates record their scores on `record`.
pub trait QualityGate: Send + Sync {
    /// Stable gate name.
    fn name(&self) -> &'static str;

    /// Evaluate `input`, recording scores on `record`.
    fn apply(
        &self,
        input: &GateInput<'_>,
        scores: &mut ScoreSource,
        record: &mut QualityRecord,
    ) -> Result<GateVerdict, PipelineError>;
}

/// Answers scoring questions either one call per gate or from one batched call.
///
/// Both modes return identical values for the same scorer.
pub struct ScoreSource {
    scorer: Arc<dyn TextScorer>,
    limiter: Arc<CallLimiter>,
    timeout: Duration,
    batched: bool,
    batch: Option<BatchScores>,
}

impl ScoreSource {
    /// Source over `scorer`; every call takes a slot from `limiter`.
    pub fn new(
        scorer: Arc<dyn TextScorer>,
        limiter: Arc<CallLimiter>,
        timeout: Duration,
        batched: bool,
    ) -> Self {
        Self {
            scorer,
            limiter,
            timeout,
            batched,
            batch: None,
        }
    }

    /// Pattern-consistency score for `input`.
    pub fn pattern_match(
        &mut self,
        input: &GateInput<'_>,
        pattern: &Pattern,
    ) -> Result<f32, CapabilityError> {
        if self.batched {
            return self
                .batch_for(input)
                .pattern_match
                .clone()
                .unwrap_or(Ok(0.0));
        }
        let scorer = Arc::clone(&self.scorer);
        let text = input.candidate.text.clone();
        let pattern = pattern.clone();
        self.limiter
            .call(self.timeout, move || scorer.pattern_match(&text, &pattern))
    }

    /// Label-flip scores for `input`.
    pub fn label_flip(&mut self, input: &GateInput<'_>) -> Result<FlipScores, CapabilityError> {
        if self.batched {
            return self.batch_for(input).label_flip.clone();
        }
        let scorer = Arc::clone(&self.scorer);
        let candidate = input.candidate.clone();
        self.limiter.call(self.timeout, move || {
            scorer.label_flip(
                &candidate.text,
                &candidate.original_label,
                &candidate.target_label,
            )
        })
    }

    fn batch_for(&mut self, input: &GateInput<'_>) -> &BatchScores {
        let scorer = Arc::clone(&self.scorer);
        let limiter = Arc::clone(&self.limiter);
        let timeout = self.timeout;
        let candidate = input.candidate.clone();
        let pattern = input.pattern.cloned();
        self.batch.get_or_insert_with(|| {
            let result = limiter.call(timeout, move || {
                let request = ScoreRequest {
                    text: &candidate.text,
                    pattern: pattern.as_ref(),
                    from_label: &candidate.original_label,
                    to_label: &candidate.target_label,
                };
                Ok(scorer.score_all(&request))
            });
            result.unwrap_or_else(|err| BatchScores {
                pattern_match: Some(Err(err.clone())),
                label_flip: Err(err),
            })
        })
    }
}

/// Clamp a collaborator score into [0, 1]; NaN becomes 0.
fn sanitize(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Map a per-call scorer error to a zero score, escalating only `Unavailable`.
fn score_or_zero<T>(
    result: Result<T, CapabilityError>,
    fallback: T,
    candidate: &Candidate,
    what: &str,
) -> Result<T, PipelineError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_fatal() => Err(err.into_pipeline(SCORER)),
        Err(err) => {
            debug!(
                "[counterfactuals:filter] {what} scoring failed for '{}', scoring 0: {err}",
                candidate.id
            );
            Ok(fallback)
        }
    }
}

/// C1: local checks for malformed generations.
#[derive(Clone, Debug)]
pub struct HeuristicGate {
    min_chars: usize,
    max_chars: usize,
    min_latin_share: f32,
}

impl HeuristicGate {
    /// Heuristic gate with bounds from `config`.
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            min_chars: config.min_chars,
            max_chars: config.max_chars,
            min_latin_share: config.min_latin_share,
        }
    }

    /// `Err(detail)` naming the first failed check.
    pub fn check(&self, text: &str, seed_text: &str) -> Result<(), Detail> {
        let trimmed = text.trim();
        if trimmed.chars().count() < self.min_chars {
            return Err("text too short".to_string());
        }
        if text.chars().count() > self.max_chars {
            return Err("text too long".to_string());
        }
        if normalize_inline_whitespace(text) == normalize_inline_whitespace(seed_text) {
            return Err("identical to seed".to_string());
        }
        if let Some(marker) = leakage_marker(text) {
            return Err(format!("prompt leakage ({marker})"));
        }
        if text.matches('"').count() % 2 != 0 {
            return Err("unmatched quotes".to_string());
        }
        if ELLIPSIS_SUFFIXES
            .iter()
            .any(|suffix| trimmed.ends_with(suffix))
        {
            return Err("truncated with ellipsis".to_string());
        }
        if has_excessive_repetition(trimmed) {
            return Err("excessive word repetition".to_string());
        }
        if let Some(remnant) = REMNANT_TOKENS.iter().find(|token| text.contains(*token)) {
            return Err(format!("formatting remnant ({remnant})"));
        }
        if text.chars().any(is_cjk) {
            return Err("non-Latin script".to_string());
        }
        match latin_share(text) {
            None => Err("no alphabetic characters".to_string()),
            Some(share) if share < self.min_latin_share => {
                Err(format!("non-Latin script (latin share {share:.2})"))
            }
            Some(_) => Ok(()),
        }
    }
}

fn has_excessive_repetition(text: &str) -> bool {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= REPETITION_MIN_WORDS {
        return false;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for word in &words {
        *counts.entry(*word).or_insert(0) += 1;
    }
    let max_repetition = counts.values().copied().max().unwrap_or(0);
    max_repetition > words.len() / 2
}

impl QualityGate for HeuristicGate {
    fn name(&self) -> &'static str {
        "c1_heuristic"
    }

    fn apply(
        &self,
        input: &GateInput<'_>,
        _scores: &mut ScoreSource,
        record: &mut QualityRecord,
    ) -> Result<GateVerdict, PipelineError> {
        match self.check(&input.candidate.text, &input.candidate.seed_text) {
            Ok(()) => {
                record.passed_c1 = true;
                Ok(GateVerdict::Pass)
            }
            Err(detail) => Ok(GateVerdict::Reject {
                reason: RejectionReason::Malformed,
                detail,
            }),
        }
    }
}

/// C2: the guiding pattern must still be present in the edited text.
#[derive(Clone, Debug)]
pub struct PatternConsistencyGate {
    threshold: f32,
}

impl PatternConsistencyGate {
    /// Gate rejecting scores below `threshold`.
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl QualityGate for PatternConsistencyGate {
    fn name(&self) -> &'static str {
        "c2_pattern"
    }

    fn apply(
        &self,
        input: &GateInput<'_>,
        scores: &mut ScoreSource,
        record: &mut QualityRecord,
    ) -> Result<GateVerdict, PipelineError> {
        if input.candidate.pattern_id.is_none() {
            record.c2_score = C2Score::NotApplicable;
            return Ok(GateVerdict::Pass);
        }
        let score = match input.pattern {
            Some(pattern) => sanitize(score_or_zero(
                scores.pattern_match(input, pattern),
                0.0,
                input.candidate,
                "pattern",
            )?),
            None => {
                debug!(
                    "[counterfactuals:filter] pattern for '{}' could not be resolved, scoring 0",
                    input.candidate.id
                );
                0.0
            }
        };
        record.c2_score = C2Score::Scored(score);
        if record.c2_score.passes(self.threshold) {
            Ok(GateVerdict::Pass)
        } else {
            Ok(GateVerdict::Reject {
                reason: RejectionReason::PatternDrift,
                detail: format!("pattern score {score:.3} < {:.3}", self.threshold),
            })
        }
    }
}

/// C3: the candidate must now read as its target label.
#[derive(Clone, Debug)]
pub struct LabelFlipGate {
    threshold: f32,
}

impl LabelFlipGate {
    /// Gate rejecting primary flip scores below `threshold`.
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl QualityGate for LabelFlipGate {
    fn name(&self) -> &'static str {
        "c3_label_flip"
    }

    fn apply(
        &self,
        input: &GateInput<'_>,
        scores: &mut ScoreSource,
        record: &mut QualityRecord,
    ) -> Result<GateVerdict, PipelineError> {
        let flip = score_or_zero(
            scores.label_flip(input),
            FlipScores::default(),
            input.candidate,
            "label flip",
        )?;
        record.c3_flip_score = sanitize(flip.primary);
        record.c3_soft_flip_score = sanitize(flip.soft);
        if record.c3_flip_score >= self.threshold {
            Ok(GateVerdict::Pass)
        } else {
            Ok(GateVerdict::Reject {
                reason: RejectionReason::LabelNotFlipped,
                detail: format!(
                    "flip score {:.3} < {:.3}",
                    record.c3_flip_score, self.threshold
                ),
            })
        }
    }
}

/// Ordered C1 → C2 → C3 filter.
pub struct ThreeStageFilter {
    gates: Vec<Box<dyn QualityGate>>,
    scorer: Arc<dyn TextScorer>,
    limiter: Arc<CallLimiter>,
    timeout: Duration,
    batched: bool,
}

impl ThreeStageFilter {
    /// Filter with thresholds from `config`, no timeout, one call at a time.
    pub fn new(scorer: Arc<dyn TextScorer>, config: &FilterConfig) -> Self {
        Self {
            gates: vec![
                Box::new(HeuristicGate::new(config)),
                Box::new(PatternConsistencyGate::new(config.c2_threshold)),
                Box::new(LabelFlipGate::new(config.c3_threshold)),
            ],
            scorer,
            limiter: Arc::new(CallLimiter::default()),
            timeout: Duration::ZERO,
            batched: config.batched_scoring,
        }
    }

    /// Bound each scorer call by `timeout` (zero disables the bound).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share `limiter` with other collaborator callers.
    pub fn with_limiter(mut self, limiter: Arc<CallLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Gate names in evaluation order.
    pub fn gate_names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|gate| gate.name()).collect()
    }

    /// Run the gates over `candidate`, guided by its resolved `pattern`.
    pub fn evaluate(
        &self,
        candidate: &Candidate,
        pattern: Option<&Pattern>,
    ) -> Result<QualityRecord, PipelineError> {
        let input = GateInput { candidate, pattern };
        let mut scores = ScoreSource::new(
            Arc::clone(&self.scorer),
            Arc::clone(&self.limiter),
            self.timeout,
            self.batched,
        );
        let mut record = QualityRecord {
            candidate_id: candidate.id.clone(),
            label: candidate.target_label.clone(),
            passed_c1: false,
            c2_score: C2Score::NotEvaluated,
            c3_flip_score: 0.0,
            c3_soft_flip_score: 0.0,
            overall_pass: false,
            rejection_reason: None,
            detail: None,
        };
        for gate in &self.gates {
            if let GateVerdict::Reject { reason, detail } =
                gate.apply(&input, &mut scores, &mut record)?
            {
                debug!(
                    "[counterfactuals:filter] '{}' rejected at {}: {reason} ({detail})",
                    candidate.id,
                    gate.name()
                );
                record.rejection_reason = Some(reason);
                record.detail = Some(detail);
                return Ok(record);
            }
        }
        record.overall_pass = true;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::LabeledExample;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedScorer {
        pattern: Result<f32, CapabilityError>,
        flip: Result<FlipScores, CapabilityError>,
        calls: AtomicUsize,
    }

    impl FixedScorer {
        fn new(pattern: f32, primary: f32, soft: f32) -> Self {
            Self {
                pattern: Ok(pattern),
                flip: Ok(FlipScores::new(primary, soft)),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TextScorer for FixedScorer {
        fn pattern_match(&self, _text: &str, _pattern: &Pattern) -> Result<f32, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pattern.clone()
        }

        fn label_flip(
            &self,
            _text: &str,
            _from_label: &str,
            _to_label: &str,
        ) -> Result<FlipScores, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.flip.clone()
        }
    }

    fn pattern() -> Pattern {
        Pattern::from_rule("service::p0", "service", "[service]+ADJ", 0.9)
    }

    fn candidate(text: &str, pattern_id: Option<&str>) -> Candidate {
        let seed = LabeledExample::new("s1", "Affordable lobster with reasonable price.", "price");
        Candidate::new(
            "cf-1".into(),
            &seed,
            "service".into(),
            pattern_id.map(str::to_string),
            text.into(),
            0,
            0,
        )
        .unwrap()
    }

    fn filter(scorer: FixedScorer, batched: bool) -> ThreeStageFilter {
        let config = FilterConfig {
            batched_scoring: batched,
            ..FilterConfig::default()
        };
        ThreeStageFilter::new(Arc::new(scorer), &config)
    }

    #[test]
    fn scenario_passes_all_gates() {
        let record = filter(FixedScorer::new(0.82, 0.91, 0.88), false)
            .evaluate(
                &candidate("Affordable lobster with terrible service.", Some("service::p0")),
                Some(&pattern()),
            )
            .unwrap();
        assert!(record.passed_c1);
        assert_eq!(record.c2_score, C2Score::Scored(0.82));
        assert_eq!(record.c3_flip_score, 0.91);
        assert_eq!(record.c3_soft_flip_score, 0.88);
        assert!(record.overall_pass);
        assert_eq!(record.rejection_reason, None);
        assert_eq!(record.label, "service");
    }

    #[test]
    fn malformed_short_circuits_without_scoring() {
        let scorer = Arc::new(FixedScorer::new(1.0, 1.0, 1.0));
        let filter = ThreeStageFilter::new(scorer.clone(), &FilterConfig::default());
        let record = filter
            .evaluate(&candidate("Great \"service", Some("service::p0")), Some(&pattern()))
            .unwrap();
        assert_eq!(record.rejection_reason, Some(RejectionReason::Malformed));
        assert_eq!(record.detail.as_deref(), Some("unmatched quotes"));
        assert_eq!(record.c2_score, C2Score::NotEvaluated);
        assert_eq!(record.c3_flip_score, 0.0);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn punctuation_only_text_is_malformed() {
        let scorer = Arc::new(FixedScorer::new(1.0, 1.0, 1.0));
        let filter = ThreeStageFilter::new(scorer.clone(), &FilterConfig::default());
        for text in ["!!!! ????", "?!?! ... !!"] {
            let record = filter.evaluate(&candidate(text, None), None).unwrap();
            assert!(!record.passed_c1, "{text}");
            assert!(!record.overall_pass);
            assert_eq!(record.rejection_reason, Some(RejectionReason::Malformed));
        }
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pattern_drift_rejects_before_flip() {
        let record = filter(FixedScorer::new(0.4, 0.95, 0.9), false)
            .evaluate(&candidate("Terrible service tonight.", Some("service::p0")), Some(&pattern()))
            .unwrap();
        assert_eq!(record.rejection_reason, Some(RejectionReason::PatternDrift));
        assert_eq!(record.c3_flip_score, 0.0);
        assert!(!record.overall_pass);
    }

    #[test]
    fn general_edit_skips_c2() {
        let record = filter(FixedScorer::new(0.0, 0.8, 0.5), false)
            .evaluate(&candidate("Terrible service tonight.", None), None)
            .unwrap();
        assert_eq!(record.c2_score, C2Score::NotApplicable);
        assert!(record.overall_pass);
    }

    #[test]
    fn unresolvable_pattern_scores_zero() {
        let record = filter(FixedScorer::new(1.0, 1.0, 1.0), false)
            .evaluate(&candidate("Terrible service tonight.", Some("gone")), None)
            .unwrap();
        assert_eq!(record.c2_score, C2Score::Scored(0.0));
        assert_eq!(record.rejection_reason, Some(RejectionReason::PatternDrift));
    }

    #[test]
    fn flip_below_threshold_keeps_both_scores() {
        let record = filter(FixedScorer::new(0.9, 0.5, 0.95), false)
            .evaluate(&candidate("Terrible service tonight.", None), None)
            .unwrap();
        assert_eq!(record.rejection_reason, Some(RejectionReason::LabelNotFlipped));
        assert_eq!(record.c3_flip_score, 0.5);
        assert_eq!(record.c3_soft_flip_score, 0.95);
    }

    #[test]
    fn scorer_failure_scores_zero_and_unavailable_aborts() {
        let mut failing = FixedScorer::new(0.9, 0.9, 0.9);
        failing.flip = Err(CapabilityError::Timeout(Duration::from_millis(5)));
        let record = filter(failing, false)
            .evaluate(&candidate("Terrible service tonight.", None), None)
            .unwrap();
        assert_eq!(record.c3_flip_score, 0.0);
        assert_eq!(record.rejection_reason, Some(RejectionReason::LabelNotFlipped));

        let mut gone = FixedScorer::new(0.9, 0.9, 0.9);
        gone.flip = Err(CapabilityError::Unavailable("model unloaded".into()));
        let err = filter(gone, false)
            .evaluate(&candidate("Terrible service tonight.", None), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::CollaboratorUnavailable { .. }));
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let record = filter(FixedScorer::new(f32::NAN, 1.7, -0.2), false)
            .evaluate(&candidate("Terrible service tonight.", Some("service::p0")), Some(&pattern()))
            .unwrap();
        assert_eq!(record.c2_score, C2Score::Scored(0.0));

        let record = filter(FixedScorer::new(0.9, 1.7, -0.2), false)
            .evaluate(&candidate("Terrible service tonight.", None), None)
            .unwrap();
        assert_eq!(record.c3_flip_score, 1.0);
        assert_eq!(record.c3_soft_flip_score, 0.0);
    }

    #[test]
    fn batched_and_direct_scoring_agree() {
        for (pattern_score, primary) in [(0.82, 0.91), (0.3, 0.9), (0.9, 0.2)] {
            let text = "Affordable lobster with terrible service.";
            let direct = filter(FixedScorer::new(pattern_score, primary, 0.5), false)
                .evaluate(&candidate(text, Some("service::p0")), Some(&pattern()))
                .unwrap();
            let batched = filter(FixedScorer::new(pattern_score, primary, 0.5), true)
                .evaluate(&candidate(text, Some("service::p0")), Some(&pattern()))
                .unwrap();
            assert_eq!(direct, batched);
        }
    }

    #[test]
    fn heuristic_checks_name_the_problem() {
        let gate = HeuristicGate::new(&FilterConfig::default());
        let seed = "Affordable lobster with reasonable price.";
        let cases = [
            ("", "text too short"),
            ("Hi.", "text too short"),
            ("Affordable  lobster with reasonable price.", "identical to seed"),
            ("Label: terrible service", "prompt leakage (label:)"),
            ("Terrible service {{ target }}", "prompt leakage ({{)"),
            ("The service was slow...", "truncated with ellipsis"),
            ("bad bad bad bad service", "excessive word repetition"),
            ("```Terrible service```", "formatting remnant (```)"),
            ("服务很差，但是龙虾便宜", "non-Latin script"),
            ("Обслуживание ужасное, очень", "non-Latin script (latin share 0.00)"),
            ("!!!! ????", "no alphabetic characters"),
            ("12345 678.", "no alphabetic characters"),
        ];
        for (text, expected) in cases {
            assert_eq!(gate.check(text, seed), Err(expected.to_string()), "{text}");
        }
        assert_eq!(gate.check("Affordable lobster with terrible service.", seed), Ok(()));
        let long = "a".repeat(2000);
        assert_eq!(gate.check(&long, seed), Err("text too long".to_string()));
    }

    #[test]
    fn gates_run_in_order() {
        let filter = filter(FixedScorer::new(1.0, 1.0, 1.0), false);
        assert_eq!(
            filter.gate_names(),
            vec!["c1_heuristic", "c2_pattern", "c3_label_flip"]
        );
    }
}
