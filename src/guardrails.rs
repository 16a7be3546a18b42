//! C10: Guardrails.
//!
//! Two layers: per-metric policy filtering for individual insights, and
//! the multi-comparison/stability guardrail applied to attribution
//! candidates. Grounded on
//! `original_source/backend/app/engine/guardrails/{policy,insight_filter,escalation}.py`
//! and `original_source/backend/app/engine/attribution/guardrails.py`.

use crate::stats;
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================
// Per-metric insight policy
// ============================================

#[derive(Debug, Clone, Copy)]
pub struct MetricPolicy {
    pub min_confidence: f64,
    pub min_coverage: f64,
    pub min_effect_size: f64,
}

pub const DEFAULT_POLICY: MetricPolicy = MetricPolicy {
    min_confidence: 0.6,
    min_coverage: 0.5,
    min_effect_size: 0.2,
};

fn metric_policy_overrides() -> BTreeMap<&'static str, MetricPolicy> {
    let mut m = BTreeMap::new();
    m.insert(
        "sleep_duration",
        MetricPolicy {
            min_confidence: 0.6,
            min_coverage: 0.6,
            min_effect_size: 0.2,
        },
    );
    m.insert(
        "resting_hr",
        MetricPolicy {
            min_confidence: 0.7,
            min_coverage: 0.5,
            min_effect_size: 0.25,
        },
    );
    m
}

pub fn policy_for_metric(metric_key: &str) -> MetricPolicy {
    metric_policy_overrides()
        .get(metric_key)
        .copied()
        .unwrap_or(DEFAULT_POLICY)
}

/// Candidate insight fields needed to evaluate the per-metric policy,
/// decoupled from [`crate::models::Insight`] so this stays a pure function
/// over plain numbers (spec.md §4.7). `id` round-trips the originating
/// insight's id so the loop runner can recover which insights survived
/// filtering without this module ever depending on `models::Insight`.
#[derive(Debug, Clone)]
pub struct InsightCandidate {
    pub id: Uuid,
    pub metric_key: String,
    pub confidence: f64,
    pub coverage: f64,
    pub effect_size: f64,
}

/// Drop insights that fail minimum trust thresholds for their metric.
pub fn filter_insights(candidates: Vec<InsightCandidate>) -> Vec<InsightCandidate> {
    candidates
        .into_iter()
        .filter(|c| {
            let policy = policy_for_metric(&c.metric_key);
            c.confidence >= policy.min_confidence
                && c.coverage >= policy.min_coverage
                && c.effect_size.abs() >= policy.min_effect_size
        })
        .collect()
}

/// Escalation: a metric with only one surfaced signal is demoted to
/// `weak_signal`; two or more independent signals escalate normally.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationStatus {
    Escalated,
    WeakSignal,
}

pub fn apply_escalation<T>(items: Vec<T>, metric_key_of: impl Fn(&T) -> String) -> Vec<(T, EscalationStatus)> {
    let mut grouped: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for item in items {
        grouped.entry(metric_key_of(&item)).or_default().push(item);
    }

    let mut out = Vec::new();
    for (_, group) in grouped {
        let status = if group.len() >= 2 {
            EscalationStatus::Escalated
        } else {
            EscalationStatus::WeakSignal
        };
        for item in group {
            out.push((item, status.clone()));
        }
    }
    out
}

// ============================================
// Attribution guardrails (multi-comparison + stability)
// ============================================

pub const MIN_ATTRIBUTION_SAMPLE_SIZE: usize = 14;
pub const MIN_ATTRIBUTION_STABILITY: f64 = 0.5;
pub const MIN_VARIANCE_EXPLAINED: f64 = 0.10;
pub const FINAL_MIN_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailLabel {
    Preliminary,
    Unstable,
    WeakAssociation,
    NotSignificant,
    Confounded,
}

#[derive(Debug, Clone)]
pub struct AttributionGuardrailResult {
    pub passed: bool,
    pub adjusted_confidence: f64,
    pub label: Option<GuardrailLabel>,
    pub violations: Vec<String>,
}

/// Applies sample-size, stability, variance-explained, and significance
/// checks to one attribution candidate, multiplying confidence down on
/// each violation (penalty factors 0.4-0.8, spec.md §4.7).
#[allow(clippy::too_many_arguments)]
pub fn apply_attribution_guardrails(
    effect_size: f64,
    confidence: f64,
    stability: f64,
    variance_explained: f64,
    sample_size: usize,
    n_comparisons: usize,
    r_squared: f64,
    fdr_alpha: f64,
) -> AttributionGuardrailResult {
    let mut violations = Vec::new();
    let mut adjusted = confidence;
    let mut label = None;

    if sample_size < MIN_ATTRIBUTION_SAMPLE_SIZE {
        violations.push(format!(
            "insufficient_sample_size_{sample_size}_<_{MIN_ATTRIBUTION_SAMPLE_SIZE}"
        ));
        adjusted *= 0.5;
        label = Some(GuardrailLabel::Preliminary);
    }

    if stability < MIN_ATTRIBUTION_STABILITY {
        violations.push(format!("low_stability_{stability:.2}_<_{MIN_ATTRIBUTION_STABILITY}"));
        adjusted *= 0.7;
        if label.is_none() {
            label = Some(GuardrailLabel::Unstable);
        }
    }

    if variance_explained < MIN_VARIANCE_EXPLAINED {
        violations.push(format!(
            "low_variance_explained_{variance_explained:.2}_<_{MIN_VARIANCE_EXPLAINED}"
        ));
        adjusted *= 0.8;
        if label.is_none() {
            label = Some(GuardrailLabel::WeakAssociation);
        }
    }

    if n_comparisons > 0 {
        let p_value = stats::p_value_from_r_squared(r_squared, sample_size);
        if n_comparisons == 1 {
            if p_value > fdr_alpha {
                violations.push(format!("p_value_not_significant_{p_value:.4}_>_{fdr_alpha}"));
                adjusted *= 0.6;
                if label.is_none() {
                    label = Some(GuardrailLabel::NotSignificant);
                }
            }
        } else {
            let bonferroni_alpha = fdr_alpha / n_comparisons as f64;
            if p_value > bonferroni_alpha {
                violations.push(format!(
                    "p_value_fails_bonferroni_{p_value:.4}_>_{bonferroni_alpha}"
                ));
                adjusted *= 0.5;
                if label.is_none() {
                    label = Some(GuardrailLabel::NotSignificant);
                }
            }
        }
    }

    if effect_size.abs() > 0.5 && variance_explained < 0.05 {
        violations.push("high_effect_low_variance_explained_possibly_confounded".to_string());
        adjusted *= 0.4;
        label = Some(GuardrailLabel::Confounded);
    }

    adjusted = adjusted.min(confidence);
    // spec.md §4.7: violations penalize and label a candidate, they don't
    // reject it outright — only the post-penalty confidence gates the
    // final pass, so a labeled driver with enough adjusted confidence
    // still surfaces (with its label).
    let passed = adjusted >= FINAL_MIN_CONFIDENCE;

    AttributionGuardrailResult {
        passed,
        adjusted_confidence: adjusted,
        label,
        violations,
    }
}

/// Applies Benjamini-Hochberg FDR correction across a set of attribution
/// p-values derived from their R² (spec.md §4.7, used alongside per-item
/// guardrails when >=2 candidates exist).
pub fn fdr_pass_mask(r_squared_values: &[f64], sample_sizes: &[usize], alpha: f64) -> Vec<bool> {
    let p_values: Vec<f64> = r_squared_values
        .iter()
        .zip(sample_sizes.iter())
        .map(|(r2, n)| stats::p_value_from_r_squared(*r2, *n))
        .collect();
    stats::benjamini_hochberg(&p_values, alpha)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_low_confidence_insight() {
        let candidates = vec![InsightCandidate {
            id: Uuid::new_v4(),
            metric_key: "sleep_duration".to_string(),
            confidence: 0.3,
            coverage: 0.9,
            effect_size: 0.5,
        }];
        assert!(filter_insights(candidates).is_empty());
    }

    #[test]
    fn keeps_insight_passing_policy() {
        let candidates = vec![InsightCandidate {
            id: Uuid::new_v4(),
            metric_key: "sleep_duration".to_string(),
            confidence: 0.8,
            coverage: 0.9,
            effect_size: 0.5,
        }];
        assert_eq!(filter_insights(candidates).len(), 1);
    }

    #[test]
    fn single_signal_is_weak() {
        let items = vec!["sleep_duration".to_string()];
        let result = apply_escalation(items, |s| s.clone());
        assert_eq!(result[0].1, EscalationStatus::WeakSignal);
    }

    #[test]
    fn two_signals_escalate() {
        let items = vec!["sleep_duration".to_string(), "sleep_duration".to_string()];
        let result = apply_escalation(items, |s| s.clone());
        assert!(result.iter().all(|(_, s)| *s == EscalationStatus::Escalated));
    }

    #[test]
    fn low_sample_size_downgrades_to_preliminary() {
        let result = apply_attribution_guardrails(0.3, 0.8, 0.9, 0.2, 5, 1, 0.2, 0.05);
        assert_eq!(result.label, Some(GuardrailLabel::Preliminary));
        assert!(result.adjusted_confidence < 0.8);
    }

    #[test]
    fn high_effect_low_variance_is_confounded() {
        let result = apply_attribution_guardrails(0.9, 0.8, 0.9, 0.02, 30, 1, 0.02, 0.05);
        assert_eq!(result.label, Some(GuardrailLabel::Confounded));
    }

    #[test]
    fn clean_signal_passes() {
        let result = apply_attribution_guardrails(0.6, 0.8, 0.9, 0.3, 30, 1, 0.3, 0.05);
        assert!(result.passed);
    }
}
