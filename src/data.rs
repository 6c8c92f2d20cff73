use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CompositeWeights;
use crate::constants::patterns::RULE_SEPARATOR;
use crate::errors::PipelineError;

pub use crate::types::{CandidateId, Detail, ExampleId, Fingerprint, Label, PatternId};

/// A labeled training example used as a seed and as pattern-learning input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabeledExample {
    /// Stable example identifier (drives cache fingerprints).
    pub id: ExampleId,
    /// Raw text.
    pub text: String,
    /// Gold label.
    pub label: Label,
}

impl LabeledExample {
    /// Build an example.
    pub fn new(id: impl Into<ExampleId>, text: impl Into<String>, label: impl Into<Label>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            label: label.into(),
        }
    }
}

/// Part-of-speech tags recognised in compact rule strings.
const POS_TAGS: &[&str] = &[
    "NOUN", "VERB", "ADJ", "ADV", "PRON", "DET", "ADP", "NUM", "CONJ", "CCONJ", "SCONJ", "PROPN",
    "AUX", "PART", "INTJ",
];

/// One element of a symbolic pattern rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternToken {
    /// Exact text that must appear (`"must match"` or a bare word).
    Literal(String),
    /// Any inflection of a word stem (`[price]`).
    Stem(String),
    /// The word or a close synonym (`(expensive)`).
    SoftMatch(String),
    /// Any token with this part-of-speech tag (`ADJ`).
    PartOfSpeech(String),
    /// A named-entity slot (`$LOCATION`).
    Entity(String),
    /// Any token sequence (`*`).
    Wildcard,
}

impl PatternToken {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            return Some(PatternToken::Wildcard);
        }
        if let Some(inner) = strip_wrapping(raw, '[', ']') {
            return Some(PatternToken::Stem(inner.to_string()));
        }
        if let Some(inner) = strip_wrapping(raw, '(', ')') {
            return Some(PatternToken::SoftMatch(inner.to_string()));
        }
        if let Some(inner) = strip_wrapping(raw, '"', '"') {
            return Some(PatternToken::Literal(inner.to_string()));
        }
        if let Some(entity) = raw.strip_prefix('$')
            && !entity.is_empty()
        {
            return Some(PatternToken::Entity(entity.to_string()));
        }
        if POS_TAGS.contains(&raw) {
            return Some(PatternToken::PartOfSpeech(raw.to_string()));
        }
        Some(PatternToken::Literal(raw.to_string()))
    }
}

impl fmt::Display for PatternToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternToken::Literal(text) => {
                let needs_quotes = text.contains(char::is_whitespace)
                    || text == "*"
                    || text.starts_with(['[', '(', '"', '$'])
                    || POS_TAGS.contains(&text.as_str());
                if needs_quotes {
                    write!(f, "\"{text}\"")
                } else {
                    write!(f, "{text}")
                }
            }
            PatternToken::Stem(stem) => write!(f, "[{stem}]"),
            PatternToken::SoftMatch(word) => write!(f, "({word})"),
            PatternToken::PartOfSpeech(tag) => write!(f, "{tag}"),
            PatternToken::Entity(name) => write!(f, "${name}"),
            PatternToken::Wildcard => write!(f, "*"),
        }
    }
}

fn strip_wrapping(raw: &str, open: char, close: char) -> Option<&str> {
    if raw.len() >= 2 && raw.starts_with(open) && raw.ends_with(close) {
        Some(&raw[open.len_utf8()..raw.len() - close.len_utf8()])
    } else {
        None
    }
}

/// A learned symbolic pattern characterising one label.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Identifier, unique within the label.
    pub id: PatternId,
    /// Label this pattern characterises.
    pub label: Label,
    /// Ordered rule tokens.
    pub tokens: Vec<PatternToken>,
    /// Example ids the pattern was learned from.
    #[serde(default)]
    pub source_examples: Vec<ExampleId>,
    /// Learner confidence in [0, 1].
    pub confidence: f32,
}

impl Pattern {
    /// Parse a compact rule such as `[price]+*+ADJ` into tokens.
    pub fn parse_rule(rule: &str) -> Vec<PatternToken> {
        rule.split(RULE_SEPARATOR)
            .filter_map(PatternToken::parse)
            .collect()
    }

    /// Render tokens back into the compact rule form.
    pub fn render_rule(&self) -> String {
        self.tokens
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(&RULE_SEPARATOR.to_string())
    }

    /// Convenience constructor from a compact rule string.
    pub fn from_rule(
        id: impl Into<PatternId>,
        label: impl Into<Label>,
        rule: &str,
        confidence: f32,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            tokens: Self::parse_rule(rule),
            source_examples: Vec::new(),
            confidence,
        }
    }
}

/// A generated counterfactual awaiting quality control.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable candidate identifier.
    pub id: CandidateId,
    /// Id of the seed example this candidate was derived from.
    pub seed_id: ExampleId,
    /// Text of the seed.
    pub seed_text: String,
    /// Label of the seed.
    pub original_label: Label,
    /// Label the candidate is meant to carry; never equal to `original_label`.
    pub target_label: Label,
    /// Pattern that guided generation; `None` means general-edit fallback.
    pub pattern_id: Option<PatternId>,
    /// Generated text.
    pub text: String,
    /// Zero-based attempt index that produced `text`.
    pub attempt: u32,
    /// Zero-based slot index within the seed's request.
    pub slot: usize,
}

impl Candidate {
    /// Build a candidate, rejecting a target label equal to the original.
    pub fn new(
        id: CandidateId,
        seed: &LabeledExample,
        target_label: Label,
        pattern_id: Option<PatternId>,
        text: String,
        attempt: u32,
        slot: usize,
    ) -> Result<Self, PipelineError> {
        if target_label == seed.label {
            return Err(PipelineError::SameLabel(target_label));
        }
        Ok(Self {
            id,
            seed_id: seed.id.clone(),
            seed_text: seed.text.clone(),
            original_label: seed.label.clone(),
            target_label,
            pattern_id,
            text,
            attempt,
            slot,
        })
    }
}

/// Outcome of the C2 pattern-consistency gate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum C2Score {
    /// Pattern-match score in [0, 1].
    Scored(f32),
    /// Candidate carried no pattern (general-edit), so C2 was skipped and counts as passing.
    NotApplicable,
    /// An earlier gate rejected the candidate before C2 ran.
    NotEvaluated,
}

impl C2Score {
    /// True when the gate is satisfied under `threshold`.
    pub fn passes(&self, threshold: f32) -> bool {
        match self {
            C2Score::Scored(score) => *score >= threshold,
            C2Score::NotApplicable => true,
            C2Score::NotEvaluated => false,
        }
    }

    /// Value used in composite scoring (`NotApplicable` counts as 1.0).
    pub fn composite_value(&self) -> f32 {
        match self {
            C2Score::Scored(score) => *score,
            C2Score::NotApplicable => 1.0,
            C2Score::NotEvaluated => 0.0,
        }
    }

    /// The score, when C2 ran.
    pub fn scored(&self) -> Option<f32> {
        match self {
            C2Score::Scored(score) => Some(*score),
            _ => None,
        }
    }
}

/// Why a candidate was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    /// C1 heuristic failure.
    Malformed,
    /// C2 pattern score below threshold.
    PatternDrift,
    /// C3 primary flip score below threshold.
    LabelNotFlipped,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectionReason::Malformed => "MALFORMED",
            RejectionReason::PatternDrift => "PATTERN_DRIFT",
            RejectionReason::LabelNotFlipped => "LABEL_NOT_FLIPPED",
        };
        f.write_str(name)
    }
}

/// Per-candidate quality verdict produced by the three-stage filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityRecord {
    /// Candidate this record describes.
    pub candidate_id: CandidateId,
    /// Target label of the candidate (the label it is selected under).
    pub label: Label,
    /// True when the heuristic gate passed.
    pub passed_c1: bool,
    /// Pattern-consistency outcome.
    pub c2_score: C2Score,
    /// Primary label-flip score.
    pub c3_flip_score: f32,
    /// Soft label-flip score.
    pub c3_soft_flip_score: f32,
    /// True when every gate passed.
    pub overall_pass: bool,
    /// Gate that rejected the candidate, if any.
    pub rejection_reason: Option<RejectionReason>,
    /// Human-readable explanation for C1 rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Detail>,
}

impl QualityRecord {
    /// Weighted composite used to rank passing candidates.
    pub fn composite(&self, weights: &CompositeWeights) -> f32 {
        weights.c2 * self.c2_score.composite_value()
            + weights.flip * self.c3_flip_score
            + weights.soft * self.c3_soft_flip_score
    }
}

/// A candidate paired with its quality verdict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedCandidate {
    /// The candidate.
    pub candidate: Candidate,
    /// Its verdict.
    pub record: QualityRecord,
}

/// One admitted demonstration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemoMember {
    /// The admitted candidate.
    pub candidate: Candidate,
    /// Its verdict.
    pub record: QualityRecord,
    /// Composite score it was ranked by.
    pub composite: f32,
}

/// Quota and realized count for one label.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCount {
    /// Label.
    pub label: Label,
    /// Quota after redistribution, including shortfall received from other labels.
    pub quota: usize,
    /// Members admitted under the label.
    pub realized: usize,
}

/// Run-level events that never abort a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunWarning {
    /// A generation slot exhausted its retry budget.
    GenerationFailure {
        /// Seed the slot belonged to.
        seed_id: ExampleId,
        /// Label the slot was rewriting toward.
        target_label: Label,
        /// Slot index.
        slot: usize,
        /// Attempts made.
        attempts: u32,
        /// Problem seen on the last attempt.
        detail: Detail,
    },
    /// Pattern learning failed; the label degrades to general-edit generation.
    LearnerFailure {
        /// Affected label.
        label: Label,
        /// Learner error.
        detail: Detail,
    },
    /// Selection could not reach the requested count (`label` is `None` for the run total).
    InsufficientPool {
        /// Short label, or `None` for the run total.
        label: Option<Label>,
        /// Quota or `target_k`.
        requested: usize,
        /// Members admitted.
        realized: usize,
        /// Passing candidates that were available.
        available: usize,
    },
    /// A seed was skipped because its label is not declared.
    SkippedSeed {
        /// Skipped seed.
        seed_id: ExampleId,
        /// Its undeclared label.
        label: Label,
    },
}

/// The selected demonstration set for one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemoSet {
    /// Artifact format version.
    pub version: u8,
    /// Content address over the selection inputs and configuration.
    pub fingerprint: Fingerprint,
    /// Members in admission order.
    pub members: Vec<DemoMember>,
    /// Quota and realized count per label, in walk order.
    pub label_counts: Vec<LabelCount>,
    /// Requested size.
    pub target_k: usize,
    /// Similarity cap used during selection.
    pub diversity_cos_max: f32,
    /// Seed of the tie-break generator.
    pub seed: u64,
    /// Weights used for the composite score.
    pub weights: CompositeWeights,
    /// Non-fatal events from the run.
    pub warnings: Vec<RunWarning>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl DemoSet {
    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when no member was admitted.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Realized count for `label` (0 when absent).
    pub fn realized_for(&self, label: &str) -> usize {
        self.label_counts
            .iter()
            .find(|count| count.label == label)
            .map(|count| count.realized)
            .unwrap_or(0)
    }

    /// True if an `INSUFFICIENT_POOL` warning names `label`.
    pub fn has_shortfall_for(&self, label: &str) -> bool {
        self.warnings.iter().any(|warning| {
            matches!(
                warning,
                RunWarning::InsufficientPool { label: Some(l), .. } if l == label
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_parses_mixed_tokens() {
        let tokens = Pattern::parse_rule("[price]+*+ADJ+(expensive)+$LOCATION+\"very good\"+menu");
        assert_eq!(
            tokens,
            vec![
                PatternToken::Stem("price".into()),
                PatternToken::Wildcard,
                PatternToken::PartOfSpeech("ADJ".into()),
                PatternToken::SoftMatch("expensive".into()),
                PatternToken::Entity("LOCATION".into()),
                PatternToken::Literal("very good".into()),
                PatternToken::Literal("menu".into()),
            ]
        );
    }

    #[test]
    fn rule_renders_canonical_form() {
        let pattern = Pattern::from_rule("price::p0", "price", "[price] + * + ADJ", 0.8);
        assert_eq!(pattern.render_rule(), "[price]+*+ADJ");
        let quoted = Pattern::from_rule("p", "x", "\"ADJ\"+\"two words\"", 0.5);
        assert_eq!(quoted.render_rule(), "\"ADJ\"+\"two words\"");
    }

    #[test]
    fn candidate_rejects_same_label() {
        let seed = LabeledExample::new("s1", "Great food.", "food");
        let err = Candidate::new("c1".into(), &seed, "food".into(), None, "Bad food.".into(), 0, 0)
            .unwrap_err();
        assert!(matches!(err, PipelineError::SameLabel(ref label) if label == "food"));
    }

    #[test]
    fn c2_not_applicable_passes_but_not_evaluated_does_not() {
        assert!(C2Score::NotApplicable.passes(0.99));
        assert!(!C2Score::NotEvaluated.passes(0.0));
        assert!(C2Score::Scored(0.6).passes(0.6));
        assert!(!C2Score::Scored(0.59).passes(0.6));
        assert_eq!(C2Score::NotApplicable.composite_value(), 1.0);
    }

    #[test]
    fn rejection_reason_serializes_as_taxonomy_name() {
        let json = serde_json::to_string(&RejectionReason::LabelNotFlipped).unwrap();
        assert_eq!(json, "\"LABEL_NOT_FLIPPED\"");
        assert_eq!(RejectionReason::PatternDrift.to_string(), "PATTERN_DRIFT");
    }

    #[test]
    fn warning_serializes_with_kind_tag() {
        let warning = RunWarning::InsufficientPool {
            label: Some("price".into()),
            requested: 3,
            realized: 0,
            available: 0,
        };
        let value = serde_json::to_value(&warning).unwrap();
        assert_eq!(value["kind"], "INSUFFICIENT_POOL");
        assert_eq!(value["label"], "price");
    }
}
