//! C15: Causal Memory.
//!
//! Accumulates evidence about a driver→metric relationship across
//! evaluations into a durable, evolving belief: tentative on first
//! observation, confirmed once enough consistent evidence piles up,
//! deprecated when a confirmed belief is strongly contradicted. Grounded
//! on `original_source/backend/app/engine/memory/causal_memory_updater.py`
//! and `original_source/backend/app/domain/repositories/causal_memory_repository.py`.

use crate::models::{CausalMemory, CausalMemoryStatus, Direction, EvaluationResult, SupportingEvaluation, Verdict};
use chrono::{DateTime, Utc};

const CONFIRM_COUNT_HIGH_CONFIDENCE: u32 = 3;
const CONFIRM_CONFIDENCE_HIGH: f64 = 0.7;
const CONFIRM_COUNT_LOW_CONFIDENCE: u32 = 2;
const CONFIRM_CONFIDENCE_LOW: f64 = 0.6;
/// Source's `confidence * 0.7` dampening applied when an existing memory's
/// direction is contradicted without enough evidence to deprecate it.
const MIXED_EVIDENCE_DAMPENING: f64 = 0.7;

/// Maps an evaluation verdict to the single-observation direction fed
/// into causal memory. `Mixed` is reserved for memory entries that have
/// *already* accumulated conflicting evidence, not for one ambiguous
/// evaluation — so `Unclear`/`InsufficientData` map to `Neutral` here
/// (a deliberate narrowing of the source's "everything else is mixed"
/// fallback, since our `Direction` type distinguishes the two cases).
fn verdict_to_direction(verdict: Verdict) -> Direction {
    match verdict {
        Verdict::Helpful => Direction::Positive,
        Verdict::NotHelpful => Direction::Negative,
        Verdict::Unclear | Verdict::InsufficientData => Direction::Neutral,
    }
}

fn status_for(evidence_count: u32, confidence: f64, current: CausalMemoryStatus) -> CausalMemoryStatus {
    let promotable = (evidence_count >= CONFIRM_COUNT_HIGH_CONFIDENCE && confidence >= CONFIRM_CONFIDENCE_HIGH)
        || (evidence_count >= CONFIRM_COUNT_LOW_CONFIDENCE && confidence >= CONFIRM_CONFIDENCE_LOW);
    if promotable {
        CausalMemoryStatus::Confirmed
    } else {
        current
    }
}

/// Folds one new observation into `existing` (or creates a fresh entry),
/// accumulating effect size and confidence as running averages weighted
/// by evidence count.
fn upsert_from_evaluation(
    existing: Option<&CausalMemory>,
    user: &str,
    driver_key: &str,
    metric_key: &str,
    direction: Direction,
    effect_size: f64,
    evaluation_id: uuid::Uuid,
    confidence: f64,
    now: DateTime<Utc>,
) -> CausalMemory {
    let entry = SupportingEvaluation { evaluation_id, effect_size, direction, confidence, recorded_at: now };

    match existing {
        Some(mem) => {
            let new_count = mem.evidence_count + 1;
            let avg_effect_size = (mem.avg_effect_size * mem.evidence_count as f64 + effect_size) / new_count as f64;
            let new_direction = if mem.direction == direction { direction } else { Direction::Mixed };
            let new_confidence = (mem.confidence * mem.evidence_count as f64 + confidence) / new_count as f64;

            let mut supporting = mem.supporting_evaluations.clone();
            supporting.push(entry);

            CausalMemory {
                user: user.to_string(),
                driver_key: driver_key.to_string(),
                metric_key: metric_key.to_string(),
                direction: new_direction,
                avg_effect_size,
                confidence: new_confidence,
                evidence_count: new_count,
                status: status_for(new_count, new_confidence, mem.status),
                first_seen_at: mem.first_seen_at,
                last_confirmed_at: now,
                supporting_evaluations: supporting,
            }
        }
        None => CausalMemory {
            user: user.to_string(),
            driver_key: driver_key.to_string(),
            metric_key: metric_key.to_string(),
            direction,
            avg_effect_size: effect_size,
            confidence,
            evidence_count: 1,
            status: CausalMemoryStatus::Tentative,
            first_seen_at: now,
            last_confirmed_at: now,
            supporting_evaluations: vec![entry],
        },
    }
}

/// Result of folding one evaluation into causal memory: the new/updated
/// entry, plus the prior entry marked deprecated when the new evidence
/// strongly contradicted it (the caller persists both).
pub struct CausalMemoryUpdate {
    pub deprecated: Option<CausalMemory>,
    pub updated: CausalMemory,
}

/// Updates causal memory for `driver_key -> evaluation.metric_key` given
/// the prior entry for that pair, if any. `driver_key` is supplied by the
/// caller (resolved from the evaluation's experiment/intervention), since
/// evaluations don't carry a driver key directly (spec.md §4.11).
pub fn update_from_evaluation(
    existing: Option<&CausalMemory>,
    evaluation: &EvaluationResult,
    driver_key: &str,
    now: DateTime<Utc>,
) -> CausalMemoryUpdate {
    let direction = verdict_to_direction(evaluation.verdict);
    let effect_size = evaluation.effect_size_d;
    let confidence = if evaluation.confidence_score > 0.0 { evaluation.confidence_score } else { 0.5 };

    match existing {
        Some(mem) if mem.direction != direction && mem.direction != Direction::Mixed => {
            if mem.status == CausalMemoryStatus::Confirmed && mem.evidence_count >= CONFIRM_COUNT_HIGH_CONFIDENCE {
                let mut deprecated = mem.clone();
                deprecated.status = CausalMemoryStatus::Deprecated;
                let fresh = upsert_from_evaluation(
                    None,
                    &evaluation.user,
                    driver_key,
                    &evaluation.metric_key,
                    direction,
                    effect_size,
                    evaluation.id,
                    confidence,
                    now,
                );
                CausalMemoryUpdate { deprecated: Some(deprecated), updated: fresh }
            } else {
                let mixed = upsert_from_evaluation(
                    Some(mem),
                    &evaluation.user,
                    driver_key,
                    &evaluation.metric_key,
                    Direction::Mixed,
                    effect_size,
                    evaluation.id,
                    confidence * MIXED_EVIDENCE_DAMPENING,
                    now,
                );
                CausalMemoryUpdate { deprecated: None, updated: mixed }
            }
        }
        other => {
            let updated = upsert_from_evaluation(
                other,
                &evaluation.user,
                driver_key,
                &evaluation.metric_key,
                direction,
                effect_size,
                evaluation.id,
                confidence,
                now,
            );
            CausalMemoryUpdate { deprecated: None, updated }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvaluationDetails, WindowStats};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn window() -> WindowStats {
        WindowStats { mean: 0.0, std: 0.0, n: 10, coverage: 0.8, ci_low: 0.0, ci_high: 0.0 }
    }

    fn evaluation(verdict: Verdict, effect_size_d: f64, confidence_score: f64, now: DateTime<Utc>) -> EvaluationResult {
        EvaluationResult {
            id: Uuid::new_v4(),
            user: "u1".to_string(),
            experiment: Uuid::new_v4(),
            metric_key: "sleep_duration".to_string(),
            baseline: window(),
            intervention: window(),
            delta: 20.0,
            percent_change: 5.0,
            effect_size_d,
            adherence_rate: 0.8,
            confidence_score,
            verdict,
            details: EvaluationDetails { baseline_window: (now, now), intervention_window: (now, now), reasons: vec![] },
            created_at: now,
        }
    }

    #[test]
    fn new_memory_starts_tentative() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let eval = evaluation(Verdict::Helpful, 0.6, 0.8, now);
        let update = update_from_evaluation(None, &eval, "melatonin", now);
        assert_eq!(update.updated.status, CausalMemoryStatus::Tentative);
        assert_eq!(update.updated.evidence_count, 1);
        assert_eq!(update.updated.direction, Direction::Positive);
    }

    #[test]
    fn promotes_to_confirmed_after_three_consistent_high_confidence_observations() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let eval = evaluation(Verdict::Helpful, 0.6, 0.8, now);
        let first = update_from_evaluation(None, &eval, "melatonin", now).updated;
        let second = update_from_evaluation(Some(&first), &eval, "melatonin", now).updated;
        let third = update_from_evaluation(Some(&second), &eval, "melatonin", now).updated;
        assert_eq!(third.status, CausalMemoryStatus::Confirmed);
        assert_eq!(third.evidence_count, 3);
    }

    #[test]
    fn contradiction_against_confirmed_memory_deprecates_and_starts_fresh() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let helpful = evaluation(Verdict::Helpful, 0.6, 0.8, now);
        let mut memory = update_from_evaluation(None, &helpful, "melatonin", now).updated;
        memory = update_from_evaluation(Some(&memory), &helpful, "melatonin", now).updated;
        memory = update_from_evaluation(Some(&memory), &helpful, "melatonin", now).updated;
        assert_eq!(memory.status, CausalMemoryStatus::Confirmed);

        let harmful = evaluation(Verdict::NotHelpful, -0.6, 0.8, now);
        let result = update_from_evaluation(Some(&memory), &harmful, "melatonin", now);
        assert!(result.deprecated.is_some());
        assert_eq!(result.deprecated.unwrap().status, CausalMemoryStatus::Deprecated);
        assert_eq!(result.updated.evidence_count, 1);
        assert_eq!(result.updated.direction, Direction::Negative);
    }

    #[test]
    fn weak_contradiction_marks_mixed_without_deprecating() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let helpful = evaluation(Verdict::Helpful, 0.6, 0.8, now);
        let memory = update_from_evaluation(None, &helpful, "melatonin", now).updated;

        let harmful = evaluation(Verdict::NotHelpful, -0.6, 0.8, now);
        let result = update_from_evaluation(Some(&memory), &harmful, "melatonin", now);
        assert!(result.deprecated.is_none());
        assert_eq!(result.updated.direction, Direction::Mixed);
    }
}
