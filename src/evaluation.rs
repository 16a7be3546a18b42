//! C14: Evaluation Service.
//!
//! Compares an experiment's baseline window against its intervention
//! window for the primary metric and renders a verdict. A "helpful"
//! verdict is only ever reached when there is logged adherence evidence
//! and the confidence score clears 0.5 — an experiment with a large effect
//! but zero adherence events comes back `unclear`, never `helpful`, since
//! there is no way to confirm the intervention was actually followed.
//! Grounded on `original_source/backend/app/engine/evaluation_service.py`.

use crate::models::{AdherenceEvent, EvaluationDetails, EvaluationResult, Experiment, HealthDataPoint, Verdict, WindowStats};
use crate::stats;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_MIN_COVERAGE: f64 = 0.60;
pub const DEFAULT_MIN_POINTS: usize = 7;
const MEANINGFUL_EFFECT: f64 = 0.35;
const MIN_CONFIDENCE_FOR_HELPFUL: f64 = 0.5;

fn aggregate_daily(points: &[(DateTime<Utc>, f64)]) -> BTreeMap<NaiveDate, f64> {
    let mut buckets: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for (ts, v) in points {
        buckets.entry(ts.date_naive()).or_default().push(*v);
    }
    buckets.into_iter().map(|(d, vs)| (d, stats::mean(&vs))).collect()
}

fn window_stats(daily: &BTreeMap<NaiveDate, f64>, start: NaiveDate, end: NaiveDate, expected_days: i64) -> (Vec<f64>, WindowStats) {
    let mut present = Vec::new();
    let mut cursor = start;
    while cursor < end {
        if let Some(v) = daily.get(&cursor) {
            present.push(*v);
        }
        cursor += Duration::days(1);
    }
    let n = present.len();
    let coverage = if expected_days <= 0 { 0.0 } else { (n as f64 / expected_days as f64).min(1.0) };
    let mean_val = if present.is_empty() { 0.0 } else { stats::mean(&present) };
    let std_val = if present.len() >= 2 { stats::pstdev(&present) } else { 0.0 };
    let (ci_low, ci_high) = if n >= 2 && std_val > 0.0 {
        stats::confidence_interval_95(mean_val, std_val, n)
    } else {
        (mean_val, mean_val)
    };
    (present, WindowStats { mean: mean_val, std: std_val, n, coverage, ci_low, ci_high })
}

/// Cohen's d with unweighted pooled population variance, matching the
/// source exactly: `pstdev(pre)`/`pstdev(post)` rather than sample
/// variance, so it intentionally differs from [`crate::stats::cohens_d`].
fn cohens_d_population(pre: &[f64], post: &[f64]) -> f64 {
    if pre.len() < 2 || post.len() < 2 {
        return 0.0;
    }
    let pre_s = stats::pstdev(pre);
    let post_s = stats::pstdev(post);
    let pooled = ((pre_s.powi(2) + post_s.powi(2)) / 2.0).sqrt();
    if pooled <= 1e-9 {
        return 0.0;
    }
    (stats::mean(post) - stats::mean(pre)) / pooled
}

fn compute_adherence_rate(events: &[AdherenceEvent], experiment: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let relevant: Vec<&AdherenceEvent> = events
        .iter()
        .filter(|e| e.experiment == experiment && e.timestamp >= start && e.timestamp < end)
        .collect();
    if relevant.is_empty() {
        return 0.0;
    }
    let taken = relevant.iter().filter(|e| e.taken).count();
    (taken as f64 / relevant.len() as f64).clamp(0.0, 1.0)
}

/// Runs the baseline-vs-intervention comparison for `experiment` as of
/// `now`, always returning a result (an under-powered experiment still
/// gets an `InsufficientData` verdict rather than an error).
pub fn evaluate_experiment(
    experiment: &Experiment,
    points: &[HealthDataPoint],
    adherence_events: &[AdherenceEvent],
    now: DateTime<Utc>,
    min_coverage: f64,
    min_points: usize,
) -> EvaluationResult {
    let baseline_days = experiment.baseline_window_days as i64;
    let intervention_days = experiment.intervention_window_days as i64;

    let start = experiment.started_at;
    let end = experiment.ended_at;

    let intervention_end_cap = start + Duration::days(intervention_days);
    let intervention_end = match end {
        Some(e) => now.min(e).min(intervention_end_cap),
        None => now.min(intervention_end_cap),
    };

    let baseline_start = start - Duration::days(baseline_days);
    let baseline_end = start;

    let pre_points: Vec<(DateTime<Utc>, f64)> = points
        .iter()
        .filter(|p| p.user == experiment.user && p.metric_key == experiment.primary_metric && p.timestamp >= baseline_start && p.timestamp < baseline_end)
        .map(|p| (p.timestamp, p.value))
        .collect();
    let post_points: Vec<(DateTime<Utc>, f64)> = points
        .iter()
        .filter(|p| p.user == experiment.user && p.metric_key == experiment.primary_metric && p.timestamp >= start && p.timestamp < intervention_end)
        .map(|p| (p.timestamp, p.value))
        .collect();

    let pre_daily = aggregate_daily(&pre_points);
    let post_daily = aggregate_daily(&post_points);

    let (pre_values, pre_stats) = window_stats(&pre_daily, baseline_start.date_naive(), baseline_end.date_naive(), baseline_days);
    let (post_values, post_stats) = window_stats(&post_daily, start.date_naive(), intervention_end.date_naive(), intervention_days);

    let adherence_rate = compute_adherence_rate(adherence_events, experiment.id, start, intervention_end);

    let delta = post_stats.mean - pre_stats.mean;
    let percent_change = if pre_stats.mean.abs() > 1e-9 { (delta / pre_stats.mean) * 100.0 } else { 0.0 };
    let effect_size_d = cohens_d_population(&pre_values, &post_values);

    let mut reasons = Vec::new();
    let mut verdict = Verdict::Unclear;

    let insufficient = pre_stats.coverage < min_coverage
        || post_stats.coverage < min_coverage
        || pre_stats.n < min_points
        || post_stats.n < min_points;
    if insufficient {
        verdict = Verdict::InsufficientData;
        if pre_stats.coverage < min_coverage || post_stats.coverage < min_coverage {
            reasons.push("coverage_below_threshold".to_string());
        }
        if pre_stats.n < min_points || post_stats.n < min_points {
            reasons.push("not_enough_points".to_string());
        }
    }

    let has_adherence_evidence = adherence_rate > 0.0;
    let abs_d = effect_size_d.abs();
    let effect_confidence = (abs_d / 0.80).min(1.0);
    let coverage_penalty = pre_stats.coverage.min(post_stats.coverage);
    let adherence_confidence = if has_adherence_evidence { 1.0 } else { 0.0 };
    let confidence_score = if !insufficient && pre_stats.n >= min_points && post_stats.n >= min_points {
        effect_confidence * coverage_penalty * adherence_confidence
    } else {
        0.0
    };

    if !insufficient {
        let meaningful = abs_d >= MEANINGFUL_EFFECT;
        let actual_dir = if delta > 0.0 { "up" } else if delta < 0.0 { "down" } else { "flat" };
        let expected_dir = experiment.expected_direction.map(|d| match d {
            crate::models::Direction::Positive => "up",
            crate::models::Direction::Negative => "down",
            _ => actual_dir,
        });
        let direction_matches = expected_dir.is_none() || expected_dir == Some(actual_dir);

        if meaningful && direction_matches {
            if !has_adherence_evidence {
                verdict = Verdict::Unclear;
                reasons.push("effect_size_meaningful_but_no_adherence_evidence".to_string());
                reasons.push("cannot_confirm_intervention_was_followed".to_string());
            } else if confidence_score < MIN_CONFIDENCE_FOR_HELPFUL {
                verdict = Verdict::Unclear;
                reasons.push("effect_size_meaningful_but_low_confidence".to_string());
                reasons.push(format!("confidence_score_below_threshold_{confidence_score:.2}"));
            } else {
                verdict = Verdict::Helpful;
                reasons.push("effect_size_meaningful".to_string());
                if expected_dir.is_some() {
                    reasons.push("direction_matches_expected".to_string());
                }
                reasons.push(format!("adherence_evidence_present_{:.0}pct", adherence_rate * 100.0));
            }
        } else if meaningful && !direction_matches {
            verdict = Verdict::NotHelpful;
            reasons.push("effect_size_meaningful_but_wrong_direction".to_string());
        } else {
            verdict = Verdict::Unclear;
            reasons.push("effect_too_small_or_noisy".to_string());
        }

        if adherence_rate == 0.0 {
            reasons.push("no_adherence_events_logged".to_string());
            reasons.push("adherence_unknown_cannot_confirm_effectiveness".to_string());
        } else if adherence_rate < 0.5 {
            reasons.push(format!("low_adherence_rate_{:.0}pct", adherence_rate * 100.0));
            reasons.push("low_adherence_reduces_confidence_in_results".to_string());
        }
    }

    EvaluationResult {
        id: Uuid::new_v4(),
        user: experiment.user.clone(),
        experiment: experiment.id,
        metric_key: experiment.primary_metric.clone(),
        baseline: pre_stats,
        intervention: post_stats,
        delta,
        percent_change,
        effect_size_d,
        adherence_rate,
        confidence_score,
        verdict,
        details: EvaluationDetails {
            baseline_window: (baseline_start, baseline_end),
            intervention_window: (start, intervention_end),
            reasons,
        },
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid as UuidT;

    fn experiment(started_at: DateTime<Utc>) -> Experiment {
        Experiment {
            id: UuidT::new_v4(),
            user: "u1".to_string(),
            intervention: "magnesium_glycinate".to_string(),
            primary_metric: "sleep_duration".to_string(),
            expected_direction: Some(crate::models::Direction::Positive),
            started_at,
            ended_at: None,
            status: crate::models::ExperimentStatus::Active,
            baseline_window_days: 14,
            intervention_window_days: 14,
        }
    }

    fn point(user: &str, metric: &str, value: f64, ts: DateTime<Utc>) -> HealthDataPoint {
        HealthDataPoint {
            id: UuidT::new_v4(),
            user: user.to_string(),
            metric_key: metric.to_string(),
            value,
            unit: "minutes".to_string(),
            timestamp: ts,
            source: "oura".to_string(),
            provenance_id: UuidT::new_v4(),
            quality_score: 1.0,
            flagged: false,
        }
    }

    #[test]
    fn insufficient_data_without_enough_points() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let exp = experiment(start);
        let now = start + Duration::days(14);
        let result = evaluate_experiment(&exp, &[], &[], now, DEFAULT_MIN_COVERAGE, DEFAULT_MIN_POINTS);
        assert_eq!(result.verdict, Verdict::InsufficientData);
    }

    #[test]
    fn meaningful_effect_without_adherence_is_unclear_not_helpful() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let exp = experiment(start);
        let now = start + Duration::days(14);
        let mut points = Vec::new();
        for i in 0..14 {
            points.push(point("u1", "sleep_duration", 380.0, start - Duration::days(14 - i)));
        }
        for i in 0..14 {
            points.push(point("u1", "sleep_duration", 460.0, start + Duration::days(i)));
        }
        let result = evaluate_experiment(&exp, &points, &[], now, DEFAULT_MIN_COVERAGE, DEFAULT_MIN_POINTS);
        assert_eq!(result.verdict, Verdict::Unclear);
        assert!(result.details.reasons.iter().any(|r| r.contains("no_adherence_evidence")));
    }

    #[test]
    fn meaningful_effect_with_adherence_is_helpful() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let exp = experiment(start);
        let now = start + Duration::days(14);
        let mut points = Vec::new();
        for i in 0..14 {
            points.push(point("u1", "sleep_duration", 380.0, start - Duration::days(14 - i)));
        }
        for i in 0..14 {
            points.push(point("u1", "sleep_duration", 460.0, start + Duration::days(i)));
        }
        let adherence: Vec<AdherenceEvent> = (0..14)
            .map(|i| AdherenceEvent {
                id: UuidT::new_v4(),
                user: "u1".to_string(),
                experiment: exp.id,
                timestamp: start + Duration::days(i),
                taken: true,
                dose: None,
            })
            .collect();
        let result = evaluate_experiment(&exp, &points, &adherence, now, DEFAULT_MIN_COVERAGE, DEFAULT_MIN_POINTS);
        assert_eq!(result.verdict, Verdict::Helpful);
        assert!(result.confidence_score >= MIN_CONFIDENCE_FOR_HELPFUL);
    }
}
