//! C4: Data Quality Scorer.
//!
//! Each ingestion batch produces a `DataQualityScore` across five weighted
//! dimensions, plus a hard-stop gate function run per point before it ever
//! reaches a batch. Grounded on
//! `original_source/backend/app/engine/quality/data_quality_service.py`.

use crate::normalizer::NormalizedPoint;
use crate::registry::MetricSpec;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Below this overall score, downstream insights must not be generated
/// from the batch (spec.md §4.2 hard stop).
pub const MIN_INSIGHT_QUALITY: f64 = 0.6;

#[derive(Debug, Clone, PartialEq)]
pub struct DataQualityScore {
    pub overall: f64,
    pub completeness: f64,
    pub consistency: f64,
    pub timeliness: f64,
    pub stability: f64,
    pub duplication: f64,
}

impl DataQualityScore {
    pub fn is_usable(&self) -> bool {
        self.overall >= MIN_INSIGHT_QUALITY
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// % of the five expected fields present per point (metric_type, value,
/// unit, timestamp, source). `NormalizedPoint` makes all fields mandatory
/// at the type level, so this is really checking for emptiness, matching
/// the source's defensive truthiness checks on an otherwise-optional shape.
pub fn score_completeness(points: &[NormalizedPoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let total_fields = points.len() * 5;
    let mut present = 0;
    for p in points {
        if !p.metric_type.is_empty() {
            present += 1;
        }
        if p.value.is_finite() {
            present += 1;
        }
        if !p.unit.is_empty() {
            present += 1;
        }
        present += 1; // timestamp is always set on a constructed DateTime<Utc>
        if !p.source.is_empty() {
            present += 1;
        }
    }
    present as f64 / total_fields as f64
}

/// Unit and range adherence against the registry's spec for each point's
/// metric. Points with no registered metric are skipped (rejected
/// elsewhere, per the source's comment).
pub fn score_consistency(points: &[NormalizedPoint], specs: &[&MetricSpec]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let mut consistent = 0;
    for p in points {
        let Some(spec) = specs.iter().find(|s| s.key == p.metric_type) else {
            continue;
        };
        if p.unit != spec.unit {
            continue;
        }
        if !spec.in_range(p.value) {
            continue;
        }
        consistent += 1;
    }
    consistent as f64 / points.len() as f64
}

/// Fraction of points ingested within 7 days of their event timestamp.
pub fn score_timeliness(points: &[NormalizedPoint], ingestion_time: DateTime<Utc>) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let timely = points
        .iter()
        .filter(|p| (ingestion_time - p.timestamp).num_seconds() as f64 / 86400.0 <= 7.0)
        .count();
    timely as f64 / points.len() as f64
}

/// Fraction of consecutive relative changes that stay within +/-50%,
/// flagging sudden large jumps that might indicate a sensor glitch.
pub fn score_stability(points: &[NormalizedPoint]) -> f64 {
    if points.len() < 2 {
        return 1.0;
    }
    let mut sorted: Vec<&NormalizedPoint> = points.iter().collect();
    sorted.sort_by_key(|p| p.timestamp);

    let mut changes = Vec::new();
    for w in sorted.windows(2) {
        let (prev, curr) = (w[0], w[1]);
        if prev.value == 0.0 {
            continue;
        }
        changes.push(((curr.value - prev.value) / prev.value).abs());
    }
    if changes.is_empty() {
        return 1.0;
    }
    let stable = changes.iter().filter(|c| **c <= 0.5).count();
    stable as f64 / changes.len() as f64
}

/// Fraction of points with a unique (metric_type, minute-rounded timestamp)
/// key — repeated keys indicate duplicate ingestion.
pub fn score_duplication(points: &[NormalizedPoint]) -> f64 {
    if points.is_empty() {
        return 1.0;
    }
    let mut seen: HashSet<(String, i64)> = HashSet::new();
    let mut duplicates = 0;
    for p in points {
        let minute_bucket = p.timestamp.timestamp() / 60;
        let key = (p.metric_type.clone(), minute_bucket);
        if !seen.insert(key) {
            duplicates += 1;
        }
    }
    (points.len() - duplicates) as f64 / points.len() as f64
}

pub fn compute_quality_score(
    points: &[NormalizedPoint],
    specs: &[&MetricSpec],
    ingestion_time: DateTime<Utc>,
) -> DataQualityScore {
    let completeness = score_completeness(points);
    let consistency = score_consistency(points, specs);
    let timeliness = score_timeliness(points, ingestion_time);
    let stability = score_stability(points);
    let duplication = score_duplication(points);

    let overall = completeness * 0.30
        + consistency * 0.30
        + timeliness * 0.15
        + stability * 0.15
        + duplication * 0.10;

    DataQualityScore {
        overall: round2(overall),
        completeness: round2(completeness),
        consistency: round2(consistency),
        timeliness: round2(timeliness),
        stability: round2(stability),
        duplication: round2(duplication),
    }
}

/// Per-point hard stop gates, run before a point is admitted into a batch.
/// Distinct from the batch-level `DataQualityScore`, which only gates
/// *insight generation*, not ingestion itself.
pub fn should_reject_point(
    point: &NormalizedPoint,
    spec: Option<&MetricSpec>,
    existing_timestamps: &[DateTime<Utc>],
) -> Option<String> {
    let Some(spec) = spec else {
        return Some("missing metric spec".to_string());
    };
    if point.unit != spec.unit {
        return Some(format!(
            "unit mismatch: got {}, expected {}",
            point.unit, spec.unit
        ));
    }
    if point.value < spec.min_value() {
        return Some(format!("value below min: {} < {}", point.value, spec.min_value()));
    }
    if point.value > spec.max_value() {
        return Some(format!("value above max: {} > {}", point.value, spec.max_value()));
    }
    let point_minute = point.timestamp.timestamp() / 60;
    if existing_timestamps
        .iter()
        .any(|ts| ts.timestamp() / 60 == point_minute)
    {
        return Some("duplicate timestamp".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::get_metric_spec;
    use chrono::TimeZone;

    fn point(metric: &str, value: f64, unit: &str, ts: DateTime<Utc>) -> NormalizedPoint {
        NormalizedPoint {
            metric_type: metric.to_string(),
            value,
            unit: unit.to_string(),
            timestamp: ts,
            source: "whoop".to_string(),
        }
    }

    #[test]
    fn empty_batch_scores_zero_completeness() {
        assert_eq!(score_completeness(&[]), 0.0);
    }

    #[test]
    fn full_batch_scores_perfect_completeness() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let points = vec![point("steps", 1000.0, "count", ts)];
        assert_eq!(score_completeness(&points), 1.0);
    }

    #[test]
    fn consistency_flags_out_of_range() {
        let spec = get_metric_spec("resting_hr").unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let points = vec![point("resting_hr", 999.0, "bpm", ts)];
        assert_eq!(score_consistency(&points, &[spec]), 0.0);
    }

    #[test]
    fn stale_data_penalized_on_timeliness() {
        let old_ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let points = vec![point("steps", 100.0, "count", old_ts)];
        let score = score_timeliness(&points, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(score, 0.0);
    }

    #[test]
    fn stability_flags_large_spike() {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let points = vec![
            point("steps", 1000.0, "count", base),
            point("steps", 5000.0, "count", base + chrono::Duration::days(1)),
        ];
        assert_eq!(score_stability(&points), 0.0);
    }

    #[test]
    fn duplication_detects_repeated_minute() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let points = vec![
            point("steps", 1000.0, "count", ts),
            point("steps", 1001.0, "count", ts),
        ];
        assert_eq!(score_duplication(&points), 0.5);
    }

    #[test]
    fn overall_below_threshold_is_unusable() {
        let score = DataQualityScore {
            overall: 0.5,
            completeness: 0.5,
            consistency: 0.5,
            timeliness: 0.5,
            stability: 0.5,
            duplication: 0.5,
        };
        assert!(!score.is_usable());
    }

    #[test]
    fn reject_point_out_of_range() {
        let spec = get_metric_spec("resting_hr").unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let p = point("resting_hr", 999.0, "bpm", ts);
        assert!(should_reject_point(&p, Some(spec), &[]).is_some());
    }

    #[test]
    fn reject_point_duplicate_timestamp() {
        let spec = get_metric_spec("steps").unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let p = point("steps", 500.0, "count", ts);
        assert!(should_reject_point(&p, Some(spec), &[ts]).is_some());
    }
}
