//! C17: Trust Engine.
//!
//! A weekly rollup of how much weight the rest of the system should put
//! behind recommendations for a given user: plenty of recent data,
//! followed protocols, and a history of consistent confirmed findings
//! earns "high" trust; thin or contradictory history keeps the system
//! conservative. Grounded on
//! `original_source/backend/app/engine/trust/trust_engine.py`.

use crate::models::{AdherenceEvent, CausalMemory, CausalMemoryStatus, HealthDataPoint, TrustComponents, TrustScore, Verdict};
use chrono::{DateTime, Duration, Utc};

const COVERAGE_WEIGHT: f64 = 0.30;
const ADHERENCE_WEIGHT: f64 = 0.25;
const SUCCESS_WEIGHT: f64 = 0.25;
const STABILITY_WEIGHT: f64 = 0.20;

const COVERAGE_WINDOW_DAYS: i64 = 30;
const EXPECTED_POINTS_PER_DAY: f64 = 1.0;

const HIGH_EVIDENCE_THRESHOLD: u32 = 3;

/// Data coverage over the trailing 30 days: one point per day is full
/// marks, more doesn't add beyond the cap.
fn data_coverage_score(points: &[HealthDataPoint], now: DateTime<Utc>) -> f64 {
    let cutoff = now - Duration::days(COVERAGE_WINDOW_DAYS);
    let count = points.iter().filter(|p| p.timestamp >= cutoff).count() as f64;
    let expected = COVERAGE_WINDOW_DAYS as f64 * EXPECTED_POINTS_PER_DAY;
    (count / expected * 100.0).min(100.0)
}

/// Adherence rate over the trailing 30 days. Zero (not neutral) when no
/// events are logged — an unmeasured protocol earns no trust credit.
fn adherence_score(events: &[AdherenceEvent], now: DateTime<Utc>) -> f64 {
    let cutoff = now - Duration::days(COVERAGE_WINDOW_DAYS);
    let recent: Vec<&AdherenceEvent> = events.iter().filter(|e| e.timestamp >= cutoff).collect();
    if recent.is_empty() {
        return 0.0;
    }
    let taken = recent.iter().filter(|e| e.taken).count() as f64;
    taken / recent.len() as f64 * 100.0
}

/// Share of evaluations with a helpful verdict. Neutral (50) with no
/// evaluations yet, since there's no evidence either way.
fn evaluation_success_rate(verdicts: &[Verdict]) -> f64 {
    if verdicts.is_empty() {
        return 50.0;
    }
    let positive = verdicts.iter().filter(|v| **v == Verdict::Helpful).count() as f64;
    positive / verdicts.len() as f64 * 100.0
}

/// Consistency of the user's confirmed causal memory: half from average
/// confidence, half from the share backed by 3+ pieces of evidence.
/// Neutral (50) with no confirmed memories yet.
fn stability_score(confirmed_memories: &[CausalMemory]) -> f64 {
    let confirmed: Vec<&CausalMemory> = confirmed_memories.iter().filter(|m| m.status == CausalMemoryStatus::Confirmed).collect();
    if confirmed.is_empty() {
        return 50.0;
    }
    let avg_confidence = confirmed.iter().map(|m| m.confidence).sum::<f64>() / confirmed.len() as f64;
    let high_evidence_count = confirmed.iter().filter(|m| m.evidence_count >= HIGH_EVIDENCE_THRESHOLD).count() as f64;
    let evidence_component = (high_evidence_count / confirmed.len() as f64 * 50.0).min(50.0);
    (avg_confidence * 50.0 + evidence_component).min(100.0)
}

/// Rolls up the four trust components for `user` as of `now`, given all
/// the caller's data points, adherence events, evaluation verdicts, and
/// causal memories for that user (callers are expected to pre-filter by
/// user; this function doesn't filter itself, mirroring the other pure
/// engine modules).
pub fn compute_trust_score(
    user: &str,
    points: &[HealthDataPoint],
    adherence_events: &[AdherenceEvent],
    evaluation_verdicts: &[Verdict],
    causal_memories: &[CausalMemory],
    now: DateTime<Utc>,
) -> TrustScore {
    let data_coverage = data_coverage_score(points, now);
    let adherence = adherence_score(adherence_events, now);
    let evaluation_success = evaluation_success_rate(evaluation_verdicts);
    let stability = stability_score(causal_memories);

    let overall =
        data_coverage * COVERAGE_WEIGHT + adherence * ADHERENCE_WEIGHT + evaluation_success * SUCCESS_WEIGHT + stability * STABILITY_WEIGHT;

    TrustScore {
        user: user.to_string(),
        overall,
        components: TrustComponents { data_coverage, adherence, evaluation_success, stability },
        last_updated_at: now,
    }
}

/// Qualitative trust tier used to gate recommendation confidence
/// elsewhere (loop_runner, narrative): `high` unlocks stronger protocol
/// confidence, `low` keeps the system conservative.
pub fn trust_level(score: &TrustScore) -> &'static str {
    if score.overall >= 75.0 {
        "high"
    } else if score.overall >= 50.0 {
        "medium"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CausalMemoryStatus, Direction};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn point(days_ago: i64, now: DateTime<Utc>) -> HealthDataPoint {
        HealthDataPoint {
            id: Uuid::new_v4(),
            user: "u1".to_string(),
            metric_key: "sleep_duration".to_string(),
            value: 420.0,
            unit: "minutes".to_string(),
            timestamp: now - Duration::days(days_ago),
            source: "oura".to_string(),
            provenance_id: Uuid::new_v4(),
            quality_score: 1.0,
            flagged: false,
        }
    }

    fn memory(status: CausalMemoryStatus, confidence: f64, evidence_count: u32, now: DateTime<Utc>) -> CausalMemory {
        CausalMemory {
            user: "u1".to_string(),
            driver_key: "melatonin".to_string(),
            metric_key: "sleep_duration".to_string(),
            direction: Direction::Positive,
            avg_effect_size: 0.6,
            confidence,
            evidence_count,
            status,
            first_seen_at: now,
            last_confirmed_at: now,
            supporting_evaluations: vec![],
        }
    }

    #[test]
    fn no_data_at_all_yields_low_trust_from_neutral_defaults() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let score = compute_trust_score("u1", &[], &[], &[], &[], now);
        assert_eq!(score.components.data_coverage, 0.0);
        assert_eq!(score.components.adherence, 0.0);
        assert_eq!(score.components.evaluation_success, 50.0);
        assert_eq!(score.components.stability, 50.0);
        assert_eq!(trust_level(&score), "low");
    }

    #[test]
    fn full_coverage_and_confirmed_memory_yields_high_trust() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let points: Vec<HealthDataPoint> = (0..30).map(|d| point(d, now)).collect();
        let memories = vec![memory(CausalMemoryStatus::Confirmed, 0.9, 5, now)];
        let verdicts = vec![Verdict::Helpful, Verdict::Helpful, Verdict::Helpful];
        let score = compute_trust_score("u1", &points, &[], &verdicts, &memories, now);
        assert_eq!(score.components.data_coverage, 100.0);
        assert!(score.overall >= 75.0);
        assert_eq!(trust_level(&score), "high");
    }

    #[test]
    fn stale_data_outside_window_does_not_count_toward_coverage() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let points = vec![point(60, now), point(45, now)];
        let score = compute_trust_score("u1", &points, &[], &[], &[], now);
        assert_eq!(score.components.data_coverage, 0.0);
    }
}
