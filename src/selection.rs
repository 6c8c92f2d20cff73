use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use rand::RngCore;
use tracing::{info, warn};

use crate::config::{LabelTarget, SelectionConfig};
use crate::constants::artifacts::DEMO_SET_VERSION;
use crate::data::{DemoMember, DemoSet, EvaluatedCandidate, LabelCount, RunWarning};
use crate::errors::PipelineError;
use crate::hash::{fingerprint_with, update_f32, update_part, update_u64};
use crate::rng::DeterministicRng;
use crate::similarity::{TextSimilarity, TextVector};
use crate::types::{Fingerprint, Label};
use crate::utils::normalize_inline_whitespace;

/// Split `target_k` across labels proportionally to their weights.
///
/// Floors are assigned first; the remainder goes one at a time, round-robin in
/// declaration order, to labels with positive weight. All-zero weights are
/// treated as equal.
pub fn allocate_quotas(target_k: usize, targets: &[LabelTarget]) -> IndexMap<Label, usize> {
    let mut quotas: IndexMap<Label, usize> = targets
        .iter()
        .map(|target| (target.label.clone(), 0))
        .collect();
    if targets.is_empty() || target_k == 0 {
        return quotas;
    }
    let positive = |w: f32| w.is_finite() && w > 0.0;
    let uniform = !targets.iter().any(|target| positive(target.weight));
    let weight_of = |target: &LabelTarget| -> f64 {
        if uniform {
            1.0
        } else if positive(target.weight) {
            f64::from(target.weight)
        } else {
            0.0
        }
    };
    let total_weight: f64 = targets.iter().map(weight_of).sum();

    let mut assigned = 0usize;
    for target in targets {
        let exact = target_k as f64 * weight_of(target) / total_weight;
        let base = (exact.floor() as usize).min(target_k - assigned);
        assigned += base;
        if let Some(quota) = quotas.get_mut(&target.label) {
            *quota += base;
        }
    }

    let recipients: Vec<&Label> = targets
        .iter()
        .filter(|target| weight_of(*target) > 0.0)
        .map(|target| &target.label)
        .collect();
    let mut idx = 0usize;
    while assigned < target_k {
        let label = recipients[idx % recipients.len()];
        if let Some(quota) = quotas.get_mut(label) {
            *quota += 1;
        }
        assigned += 1;
        idx += 1;
    }
    quotas
}

/// A passing candidate with its ranking keys.
struct Ranked {
    pool_idx: usize,
    composite: f32,
    tie_draw: u64,
}

/// Per-label walk state.
struct LabelLane {
    ranked: Vec<Ranked>,
    cursor: usize,
    quota: usize,
    remaining: usize,
    /// Quota received from exhausted lanes and not yet used.
    received: usize,
    exhausted: bool,
    admitted: usize,
}

/// Picks a bounded, diverse, label-balanced demonstration set.
pub struct DiversitySelector {
    similarity: Arc<dyn TextSimilarity>,
    config: SelectionConfig,
}

impl DiversitySelector {
    /// Selector comparing texts with `similarity`.
    pub fn new(similarity: Arc<dyn TextSimilarity>, config: SelectionConfig) -> Self {
        Self { similarity, config }
    }

    /// Selection settings.
    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Select from `pool` (non-passing records are ignored) under `label_targets`.
    ///
    /// Deterministic for a given pool, configuration, and seed.
    pub fn select(
        &self,
        pool: &[EvaluatedCandidate],
        label_targets: &[LabelTarget],
    ) -> Result<DemoSet, PipelineError> {
        let target_k = self.config.target_k;
        let cap = self.config.diversity_cos_max;
        let weights = self.config.weights;

        let passing: Vec<&EvaluatedCandidate> =
            pool.iter().filter(|entry| entry.record.overall_pass).collect();

        let targets = extend_targets(label_targets, &passing);
        let quotas = allocate_quotas(target_k, &targets);

        let draws = tie_break_draws(&passing, self.config.seed);
        let mut lanes: IndexMap<Label, LabelLane> = quotas
            .iter()
            .map(|(label, quota)| {
                (
                    label.clone(),
                    LabelLane {
                        ranked: Vec::new(),
                        cursor: 0,
                        quota: *quota,
                        remaining: *quota,
                        received: 0,
                        exhausted: false,
                        admitted: 0,
                    },
                )
            })
            .collect();
        for (pool_idx, entry) in passing.iter().enumerate() {
            if let Some(lane) = lanes.get_mut(&entry.record.label) {
                lane.ranked.push(Ranked {
                    pool_idx,
                    composite: entry.record.composite(&weights),
                    tie_draw: draws[pool_idx],
                });
            }
        }
        for lane in lanes.values_mut() {
            lane.ranked.sort_by(|a, b| {
                b.composite
                    .total_cmp(&a.composite)
                    .then_with(|| a.tie_draw.cmp(&b.tie_draw))
                    .then_with(|| {
                        passing[a.pool_idx]
                            .candidate
                            .id
                            .cmp(&passing[b.pool_idx].candidate.id)
                    })
            });
        }

        let texts: Vec<String> = passing
            .iter()
            .map(|entry| entry.candidate.text.clone())
            .collect();
        let spread = Spread {
            vectors: self.similarity.vectorize(&texts)?,
            keys: texts
                .iter()
                .map(|text| normalize_inline_whitespace(text).to_lowercase())
                .collect(),
        };

        let admitted = walk(&mut lanes, &spread, cap, target_k);

        let members: Vec<DemoMember> = admitted
            .iter()
            .map(|(pool_idx, composite)| DemoMember {
                candidate: passing[*pool_idx].candidate.clone(),
                record: passing[*pool_idx].record.clone(),
                composite: *composite,
            })
            .collect();

        let mut warnings = Vec::new();
        let mut label_counts = Vec::with_capacity(lanes.len());
        for (label, lane) in &lanes {
            if lane.admitted < lane.quota {
                warn!(
                    "[counterfactuals:select] label '{label}' realized {}/{} (pool {})",
                    lane.admitted,
                    lane.quota,
                    lane.ranked.len()
                );
                warnings.push(RunWarning::InsufficientPool {
                    label: Some(label.clone()),
                    requested: lane.quota,
                    realized: lane.admitted,
                    available: lane.ranked.len(),
                });
            }
            label_counts.push(LabelCount {
                label: label.clone(),
                quota: lane.quota,
                realized: lane.admitted,
            });
        }
        if members.len() < target_k {
            warn!(
                "[counterfactuals:select] selected {}/{target_k} demonstrations from {} passing candidates",
                members.len(),
                passing.len()
            );
            warnings.push(RunWarning::InsufficientPool {
                label: None,
                requested: target_k,
                realized: members.len(),
                available: passing.len(),
            });
        }

        let fingerprint = self.fingerprint(&passing, &targets);
        info!(
            "[counterfactuals:select] selected {} demonstrations ({} passing, similarity={}, seed={})",
            members.len(),
            passing.len(),
            self.similarity.name(),
            self.config.seed
        );
        Ok(DemoSet {
            version: DEMO_SET_VERSION,
            fingerprint,
            members,
            label_counts,
            target_k,
            diversity_cos_max: cap,
            seed: self.config.seed,
            weights,
            warnings,
            created_at: Utc::now(),
        })
    }

    fn fingerprint(
        &self,
        passing: &[&EvaluatedCandidate],
        targets: &[LabelTarget],
    ) -> Fingerprint {
        let mut ordered: Vec<&&EvaluatedCandidate> = passing.iter().collect();
        ordered.sort_by(|a, b| a.candidate.id.cmp(&b.candidate.id));
        fingerprint_with(|hasher| {
            update_u64(hasher, self.config.target_k as u64);
            update_f32(hasher, self.config.diversity_cos_max);
            update_u64(hasher, self.config.seed);
            update_f32(hasher, self.config.weights.c2);
            update_f32(hasher, self.config.weights.flip);
            update_f32(hasher, self.config.weights.soft);
            update_part(hasher, self.similarity.name());
            update_u64(hasher, targets.len() as u64);
            for target in targets {
                update_part(hasher, &target.label);
                update_f32(hasher, target.weight);
            }
            update_u64(hasher, ordered.len() as u64);
            for entry in ordered {
                update_part(hasher, &entry.candidate.id);
                update_part(hasher, &entry.record.label);
                update_part(hasher, &entry.candidate.text);
                update_f32(hasher, entry.record.composite(&self.config.weights));
            }
        })
    }
}

/// Declared targets followed by undeclared pool labels (sorted, weight 1).
fn extend_targets(declared: &[LabelTarget], passing: &[&EvaluatedCandidate]) -> Vec<LabelTarget> {
    let mut targets = declared.to_vec();
    let mut extra: Vec<&Label> = passing
        .iter()
        .map(|entry| &entry.record.label)
        .filter(|label| !declared.iter().any(|target| &target.label == *label))
        .collect();
    extra.sort();
    extra.dedup();
    targets.extend(extra.into_iter().map(|label| LabelTarget::new(label.clone(), 1.0)));
    targets
}

/// One draw per passing candidate, assigned in candidate-id order.
fn tie_break_draws(passing: &[&EvaluatedCandidate], seed: u64) -> Vec<u64> {
    let mut order: Vec<usize> = (0..passing.len()).collect();
    order.sort_by(|a, b| passing[*a].candidate.id.cmp(&passing[*b].candidate.id));
    let mut rng = DeterministicRng::for_tie_breaks(seed);
    let mut draws = vec![0u64; passing.len()];
    for idx in order {
        draws[idx] = rng.next_u64();
    }
    draws
}

/// Vectors and normalized texts of the passing pool, indexed alike.
struct Spread {
    vectors: Vec<TextVector>,
    keys: Vec<String>,
}

impl Spread {
    /// Identical normalized texts score 1.0 even when their vectors are empty.
    fn similarity(&self, a: usize, b: usize) -> f32 {
        if self.keys[a] == self.keys[b] {
            1.0
        } else {
            self.vectors[a].cosine(&self.vectors[b])
        }
    }
}

/// Interleaved greedy walk with round-robin shortfall redistribution.
///
/// Returns `(pool index, composite)` in admission order.
fn walk(
    lanes: &mut IndexMap<Label, LabelLane>,
    spread: &Spread,
    cap: f32,
    target_k: usize,
) -> Vec<(usize, f32)> {
    let mut admitted: Vec<(usize, f32)> = Vec::new();
    let mut redistribution_idx = 0usize;

    loop {
        let mut progressed = false;
        for lane in lanes.values_mut() {
            if admitted.len() >= target_k {
                break;
            }
            if lane.remaining == 0 || lane.exhausted {
                continue;
            }
            match next_eligible(lane, &admitted, spread, cap) {
                Some(ranked_idx) => {
                    let ranked = &lane.ranked[ranked_idx];
                    admitted.push((ranked.pool_idx, ranked.composite));
                    lane.remaining -= 1;
                    lane.admitted += 1;
                    progressed = true;
                }
                None => lane.exhausted = true,
            }
        }

        // Eligibility only shrinks as members are admitted, so a lane with no
        // eligible candidate left can never admit again.
        for lane in lanes.values_mut() {
            if !lane.exhausted && !skip_ineligible(lane, &admitted, spread, cap) {
                lane.exhausted = true;
            }
        }

        let mut freed = 0usize;
        for lane in lanes.values_mut() {
            if lane.exhausted && lane.remaining > 0 {
                let returned = lane.remaining.min(lane.received);
                lane.quota -= returned;
                lane.received -= returned;
                freed += lane.remaining;
                lane.remaining = 0;
            }
        }
        let recipients: Vec<usize> = lanes
            .values()
            .enumerate()
            .filter(|(_, lane)| !lane.exhausted)
            .map(|(idx, _)| idx)
            .collect();
        if freed > 0 && !recipients.is_empty() {
            for _ in 0..freed {
                let lane_idx = recipients[redistribution_idx % recipients.len()];
                redistribution_idx += 1;
                if let Some((_, lane)) = lanes.get_index_mut(lane_idx) {
                    lane.quota += 1;
                    lane.remaining += 1;
                    lane.received += 1;
                }
            }
            progressed = true;
        }

        if !progressed || admitted.len() >= target_k {
            break;
        }
    }
    admitted
}

/// Advance `lane` to its next candidate compatible with every admitted member.
fn next_eligible(
    lane: &mut LabelLane,
    admitted: &[(usize, f32)],
    spread: &Spread,
    cap: f32,
) -> Option<usize> {
    if !skip_ineligible(lane, admitted, spread, cap) {
        return None;
    }
    let idx = lane.cursor;
    lane.cursor += 1;
    Some(idx)
}

/// Move `lane.cursor` past candidates too similar to an admitted member.
///
/// Returns true if the cursor now rests on an eligible candidate.
fn skip_ineligible(
    lane: &mut LabelLane,
    admitted: &[(usize, f32)],
    spread: &Spread,
    cap: f32,
) -> bool {
    while let Some(ranked) = lane.ranked.get(lane.cursor) {
        let diverse = admitted
            .iter()
            .all(|(member, _)| spread.similarity(ranked.pool_idx, *member) < cap);
        if diverse {
            return true;
        }
        lane.cursor += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompositeWeights;
    use crate::data::{C2Score, Candidate, LabeledExample, QualityRecord};
    use crate::similarity::TokenCosine;
    use std::collections::HashMap;

    fn evaluated(id: &str, label: &str, text: &str, flip: f32, pass: bool) -> EvaluatedCandidate {
        let original = if label == "price" { "service" } else { "price" };
        let seed = LabeledExample::new(format!("seed-{id}"), "seed text here", original);
        let candidate =
            Candidate::new(id.into(), &seed, label.into(), None, text.into(), 0, 0).unwrap();
        EvaluatedCandidate {
            record: QualityRecord {
                candidate_id: id.into(),
                label: label.into(),
                passed_c1: true,
                c2_score: C2Score::NotApplicable,
                c3_flip_score: flip,
                c3_soft_flip_score: flip,
                overall_pass: pass,
                rejection_reason: None,
                detail: None,
            },
            candidate,
        }
    }

    fn selector(target_k: usize, cap: f32) -> DiversitySelector {
        DiversitySelector::new(
            Arc::new(TokenCosine),
            SelectionConfig {
                target_k,
                diversity_cos_max: cap,
                ..SelectionConfig::default()
            },
        )
    }

    fn targets(labels: &[&str]) -> Vec<LabelTarget> {
        labels.iter().map(|l| LabelTarget::new(*l, 1.0)).collect()
    }

    /// Similarity looked up from a fixed table of dense vectors.
    struct TableSimilarity(HashMap<String, Vec<f32>>);

    impl TextSimilarity for TableSimilarity {
        fn name(&self) -> &'static str {
            "table"
        }

        fn vectorize(&self, texts: &[String]) -> Result<Vec<TextVector>, PipelineError> {
            Ok(texts
                .iter()
                .map(|text| TextVector::Dense(self.0.get(text).cloned().unwrap_or_default()))
                .collect())
        }
    }

    #[test]
    fn quotas_split_evenly_with_round_robin_remainder() {
        let quotas = allocate_quotas(5, &targets(&["food", "price", "service"]));
        assert_eq!(
            quotas.into_iter().collect::<Vec<_>>(),
            vec![
                ("food".to_string(), 2),
                ("price".to_string(), 2),
                ("service".to_string(), 1)
            ]
        );
    }

    #[test]
    fn quotas_follow_weights() {
        let weighted = vec![LabelTarget::new("a", 3.0), LabelTarget::new("b", 1.0)];
        let quotas = allocate_quotas(8, &weighted);
        assert_eq!(quotas["a"], 6);
        assert_eq!(quotas["b"], 2);
        let zero = vec![LabelTarget::new("a", 1.0), LabelTarget::new("b", 0.0)];
        assert_eq!(allocate_quotas(3, &zero)["b"], 0);
    }

    #[test]
    fn admits_only_passing_and_respects_target() {
        let pool = vec![
            evaluated("c1", "price", "cheap lobster deal", 0.9, true),
            evaluated("c2", "service", "rude waiter tonight", 0.9, true),
            evaluated("c3", "price", "costly wine list", 0.8, false),
            evaluated("c4", "service", "slow kitchen staff", 0.8, true),
        ];
        let demo = selector(2, 0.9)
            .select(&pool, &targets(&["price", "service"]))
            .unwrap();
        assert_eq!(demo.len(), 2);
        assert!(demo.members.iter().all(|m| m.record.overall_pass));
        assert_eq!(demo.realized_for("price"), 1);
        assert_eq!(demo.realized_for("service"), 1);
        assert!(demo.warnings.is_empty());
    }

    #[test]
    fn near_duplicate_is_excluded() {
        let mut table = HashMap::new();
        table.insert("first".to_string(), vec![1.0, 0.0]);
        table.insert("second".to_string(), vec![0.95, (1.0f32 - 0.95 * 0.95).sqrt()]);
        table.insert("third".to_string(), vec![0.0, 1.0]);
        let selector = DiversitySelector::new(
            Arc::new(TableSimilarity(table)),
            SelectionConfig {
                target_k: 2,
                diversity_cos_max: 0.9,
                ..SelectionConfig::default()
            },
        );
        let pool = vec![
            evaluated("a", "service", "first", 0.95, true),
            evaluated("b", "service", "second", 0.9, true),
            evaluated("c", "service", "third", 0.8, true),
        ];
        let demo = selector.select(&pool, &targets(&["service"])).unwrap();
        let ids: Vec<_> = demo.members.iter().map(|m| m.candidate.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn empty_label_quota_moves_to_others() {
        let pool = vec![
            evaluated("p1", "price", "cheap lobster deal", 0.9, true),
            evaluated("p2", "price", "fair wine prices", 0.85, true),
            evaluated("p3", "price", "bargain dessert menu", 0.8, true),
            evaluated("s1", "service", "rude waiter tonight", 0.9, false),
        ];
        let demo = selector(4, 0.9)
            .select(&pool, &targets(&["price", "service"]))
            .unwrap();
        assert_eq!(demo.realized_for("price"), 3);
        assert_eq!(demo.realized_for("service"), 0);
        assert!(demo.has_shortfall_for("service"));
        assert!(!demo.has_shortfall_for("price"));
        let price = demo.label_counts.iter().find(|c| c.label == "price").unwrap();
        assert_eq!(price.quota, 3);
        assert!(demo.warnings.iter().any(|w| matches!(
            w,
            RunWarning::InsufficientPool { label: None, requested: 4, realized: 3, .. }
        )));
        let total: usize = demo.label_counts.iter().map(|c| c.realized).sum();
        assert_eq!(total, demo.len());
    }

    #[test]
    fn redistribution_fills_target_when_pool_allows() {
        let pool = vec![
            evaluated("p1", "price", "cheap lobster deal", 0.9, true),
            evaluated("p2", "price", "fair wine prices", 0.85, true),
            evaluated("p3", "price", "bargain dessert menu", 0.8, true),
        ];
        let demo = selector(2, 0.9)
            .select(&pool, &targets(&["price", "service"]))
            .unwrap();
        assert_eq!(demo.len(), 2);
        assert_eq!(demo.realized_for("price"), 2);
        assert!(demo.has_shortfall_for("service"));
        assert!(!demo.has_shortfall_for("price"));
        let price = demo.label_counts.iter().find(|c| c.label == "price").unwrap();
        assert_eq!(price.quota, 2);
    }

    #[test]
    fn ties_break_deterministically_by_seed() {
        let pool: Vec<_> = (0..6)
            .map(|i| evaluated(&format!("t{i}"), "price", &format!("distinct text {i} word{i}"), 0.8, true))
            .collect();
        let pick = |seed: u64| {
            let selector = DiversitySelector::new(
                Arc::new(TokenCosine),
                SelectionConfig {
                    target_k: 1,
                    diversity_cos_max: 1.0,
                    seed,
                    ..SelectionConfig::default()
                },
            );
            selector.select(&pool, &targets(&["price"])).unwrap()
        };
        let first = pick(42);
        let again = pick(42);
        assert_eq!(first.members, again.members);
        assert_eq!(first.fingerprint, again.fingerprint);
        assert_ne!(first.fingerprint, pick(7).fingerprint);
    }

    #[test]
    fn composite_uses_configured_weights() {
        let mut entry = evaluated("a", "service", "terrible service", 0.91, true);
        entry.record.c2_score = C2Score::Scored(0.82);
        entry.record.c3_soft_flip_score = 0.88;
        let demo = selector(1, 0.9)
            .select(&[entry], &targets(&["price", "service"]))
            .unwrap();
        let expected = CompositeWeights::default().c2 * 0.82
            + CompositeWeights::default().flip * 0.91
            + CompositeWeights::default().soft * 0.88;
        assert!((demo.members[0].composite - expected).abs() < 1e-6);
        assert!((demo.members[0].composite - 0.865).abs() < 0.005);
    }

    #[test]
    fn undeclared_pool_labels_are_appended() {
        let pool = vec![
            evaluated("x", "ambience", "lovely terrace view", 0.9, true),
            evaluated("p", "price", "cheap lobster deal", 0.9, true),
        ];
        let demo = selector(2, 0.9).select(&pool, &targets(&["price"])).unwrap();
        let labels: Vec<_> = demo.label_counts.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["price", "ambience"]);
        assert_eq!(demo.len(), 2);
    }

    #[test]
    fn freed_quota_skips_labels_with_nothing_left() {
        let pool = vec![
            evaluated("a1", "ambience", "lovely terrace view", 0.9, true),
            evaluated("c1", "food", "bland soup tonight", 0.9, true),
            evaluated("c2", "food", "overcooked pasta again", 0.8, true),
            evaluated("d1", "service", "rude waiter all night", 0.9, true),
            evaluated("d2", "service", "slow kitchen staff", 0.8, true),
        ];
        let demo = selector(4, 0.9)
            .select(&pool, &targets(&["ambience", "price", "food", "service"]))
            .unwrap();
        let count = |label: &str| {
            demo.label_counts
                .iter()
                .find(|c| c.label == label)
                .map(|c| (c.quota, c.realized))
                .unwrap()
        };
        assert_eq!(demo.len(), 4);
        assert_eq!(count("ambience"), (1, 1));
        assert_eq!(count("price"), (1, 0));
        assert_eq!(count("food"), (2, 2));
        assert_eq!(count("service"), (1, 1));
        assert!(!demo.has_shortfall_for("ambience"));
        assert!(!demo.has_shortfall_for("food"));
        assert!(!demo.has_shortfall_for("service"));
        assert!(demo.has_shortfall_for("price"));
    }

    #[test]
    fn unused_received_quota_is_returned() {
        let pool = vec![
            evaluated("p1", "price", "cheap lobster deal", 0.9, true),
            evaluated("p2", "price", "fair wine prices", 0.85, true),
        ];
        let demo = selector(4, 0.9)
            .select(&pool, &targets(&["price", "service"]))
            .unwrap();
        let price = demo.label_counts.iter().find(|c| c.label == "price").unwrap();
        assert_eq!((price.quota, price.realized), (2, 2));
        assert!(!demo.has_shortfall_for("price"));
        assert!(demo.has_shortfall_for("service"));
    }

    #[test]
    fn identical_texts_without_tokens_count_as_duplicates() {
        let pool = vec![
            evaluated("d1", "price", "!!!! ????", 0.9, true),
            evaluated("d2", "price", "!!!!   ????", 0.8, true),
            evaluated("d3", "price", "?? !!", 0.7, true),
        ];
        let demo = selector(3, 0.9)
            .select(&pool, &targets(&["price"]))
            .unwrap();
        let ids: Vec<&str> = demo
            .members
            .iter()
            .map(|m| m.candidate.id.as_str())
            .collect();
        assert_eq!(ids, vec!["d1", "d3"]);
        assert!(demo.has_shortfall_for("price"));
    }
}
