use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::FilterConfig;
use crate::data::{DemoSet, QualityRecord, RejectionReason};
use crate::types::Label;

/// Pass counts for one target label.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelQuality {
    /// Records for the label.
    pub total: usize,
    /// Records that passed every gate.
    pub passed: usize,
}

/// Aggregate filter statistics over a run's quality records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Records seen.
    pub total: usize,
    /// Records passing C1.
    pub c1_passed: usize,
    /// `c1_passed / total`.
    pub c1_pass_rate: f64,
    /// Records whose pattern was scored by C2.
    pub c2_scored: usize,
    /// Pattern keep rate: share of C2-scored records at or above the C2 threshold.
    pub pkr: f64,
    /// Records that reached C3.
    pub c3_evaluated: usize,
    /// Label flip rate: share of C3-evaluated records at or above the C3 threshold.
    pub lfr: f64,
    /// Soft label flip rate: share of C3-evaluated records whose soft score clears the C3 threshold.
    pub slfr: f64,
    /// Records passing every gate.
    pub passed: usize,
    /// `passed / total`.
    pub pass_rate: f64,
    /// Rejection counts per reason.
    pub rejections: BTreeMap<RejectionReason, usize>,
    /// Breakdown per target label.
    pub per_label: BTreeMap<Label, LabelQuality>,
}

fn rate(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

impl QualityReport {
    /// Summarise `records` under the thresholds in `config`.
    pub fn from_records(records: &[QualityRecord], config: &FilterConfig) -> Self {
        let mut report = QualityReport {
            total: records.len(),
            ..QualityReport::default()
        };
        let mut pattern_kept = 0usize;
        let mut flipped = 0usize;
        let mut soft_flipped = 0usize;

        for record in records {
            if record.passed_c1 {
                report.c1_passed += 1;
            }
            if let Some(score) = record.c2_score.scored() {
                report.c2_scored += 1;
                if score >= config.c2_threshold {
                    pattern_kept += 1;
                }
            }
            let reached_c3 = matches!(
                record.rejection_reason,
                None | Some(RejectionReason::LabelNotFlipped)
            );
            if reached_c3 {
                report.c3_evaluated += 1;
                if record.c3_flip_score >= config.c3_threshold {
                    flipped += 1;
                }
                if record.c3_soft_flip_score >= config.c3_threshold {
                    soft_flipped += 1;
                }
            }
            if record.overall_pass {
                report.passed += 1;
            }
            if let Some(reason) = record.rejection_reason {
                *report.rejections.entry(reason).or_insert(0) += 1;
            }
            let label = report.per_label.entry(record.label.clone()).or_default();
            label.total += 1;
            if record.overall_pass {
                label.passed += 1;
            }
        }

        report.c1_pass_rate = rate(report.c1_passed, report.total);
        report.pkr = rate(pattern_kept, report.c2_scored);
        report.lfr = rate(flipped, report.c3_evaluated);
        report.slfr = rate(soft_flipped, report.c3_evaluated);
        report.pass_rate = rate(report.passed, report.total);
        report
    }

    /// Rejection count for `reason`.
    pub fn rejected_for(&self, reason: RejectionReason) -> usize {
        self.rejections.get(&reason).copied().unwrap_or(0)
    }
}

/// Aggregate skew metrics for per-label demonstration counts.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelSkew {
    /// Members counted.
    pub total: usize,
    /// Labels with at least one member.
    pub labels: usize,
    /// Smallest per-label count.
    pub min: usize,
    /// Largest per-label count.
    pub max: usize,
    /// Mean per-label count.
    pub mean: f64,
    /// Largest share of the total.
    pub max_share: f64,
    /// Smallest share of the total.
    pub min_share: f64,
    /// `max / min`.
    pub ratio: f64,
    /// Per-label counts and shares.
    pub per_label: Vec<LabelShare>,
}

/// Per-label share of a demonstration set.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelShare {
    /// Label.
    pub label: Label,
    /// Members under the label.
    pub count: usize,
    /// Share of all members.
    pub share: f64,
}

/// Compute skew metrics from a DemoSet's realized label counts.
pub fn label_skew(demo_set: &DemoSet) -> Option<LabelSkew> {
    let counts: Vec<(&Label, usize)> = demo_set
        .label_counts
        .iter()
        .map(|count| (&count.label, count.realized))
        .collect();
    let min = counts.iter().map(|(_, count)| *count).min()?;
    let max = counts.iter().map(|(_, count)| *count).max()?;
    let total: usize = counts.iter().map(|(_, count)| count).sum();
    let labels = counts.len();
    let mean = total as f64 / labels as f64;
    let ratio = if min == 0 {
        f64::INFINITY
    } else {
        max as f64 / min as f64
    };
    let mut per_label: Vec<LabelShare> = counts
        .iter()
        .map(|(label, count)| LabelShare {
            label: (*label).clone(),
            count: *count,
            share: rate(*count, total),
        })
        .collect();
    per_label.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    Some(LabelSkew {
        total,
        labels,
        min,
        max,
        mean,
        max_share: rate(max, total),
        min_share: rate(min, total),
        ratio,
        per_label,
    })
}
