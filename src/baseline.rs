//! C7: Baseline Service.
//!
//! Per-(user,metric) rolling mean/population-stddev over the last
//! `window_days`. Never returns a silent default: callers either get a
//! [`Baseline`] or a typed, explicitly-recoverable [`BaselineError`].
//! Grounded on `original_source/backend/app/engine/baseline_service.py`.

use crate::models::{Baseline, HealthDataPoint};
use crate::registry::{self, RegistryError};
use crate::stats;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub const MIN_BASELINE_POINTS: usize = 5;
pub const DEFAULT_WINDOW_DAYS: u32 = 30;
/// §4.17 "baselines_frozen": no wearable data within this many hours means
/// baselines are served read-only rather than recomputed.
pub const DISCONNECT_THRESHOLD_HOURS: i64 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineErrorType {
    MetricNotFound,
    InsufficientData,
    DatabaseError,
    ComputationError,
    TableMissing,
}

#[derive(Debug, Error, Clone)]
#[error("baseline unavailable: {error_type:?} (recoverable={recoverable}): {message}")]
pub struct BaselineError {
    pub error_type: BaselineErrorType,
    pub message: String,
    pub recoverable: bool,
}

impl BaselineError {
    fn new(error_type: BaselineErrorType, message: impl Into<String>, recoverable: bool) -> Self {
        BaselineError {
            error_type,
            message: message.into(),
            recoverable,
        }
    }
}

/// Compute a baseline for `user`/`metric_key` from `points` (assumed to be
/// all known points for that user/metric, any order). `points` standing in
/// for a repository query keeps this function a pure computation, matching
/// spec.md §5 ("computation is strictly CPU-bound").
pub fn recompute_baseline(
    user: &str,
    metric_key: &str,
    points: &[HealthDataPoint],
    window_days: u32,
    now: DateTime<Utc>,
) -> Result<Baseline, BaselineError> {
    if let Err(RegistryError::NotFound(key)) = registry::get_metric_spec(metric_key) {
        return Err(BaselineError::new(
            BaselineErrorType::MetricNotFound,
            format!("metric '{key}' not found in registry"),
            false,
        ));
    }

    let since = now - Duration::days(window_days as i64);
    let values: Vec<f64> = points
        .iter()
        .filter(|p| p.user == user && p.metric_key == metric_key && p.timestamp >= since)
        .map(|p| p.value)
        .collect();

    if values.len() < MIN_BASELINE_POINTS {
        return Err(BaselineError::new(
            BaselineErrorType::InsufficientData,
            format!(
                "insufficient data for baseline: {} < {} points required",
                values.len(),
                MIN_BASELINE_POINTS
            ),
            true,
        ));
    }

    let mu = stats::mean(&values);
    let sd = stats::pstdev(&values);
    if !mu.is_finite() || !sd.is_finite() {
        return Err(BaselineError::new(
            BaselineErrorType::ComputationError,
            "statistical computation produced a non-finite result",
            false,
        ));
    }

    Ok(Baseline {
        user: user.to_string(),
        metric_key: metric_key.to_string(),
        mean: mu,
        std: sd,
        sample_count: values.len(),
        window_days,
        computed_at: now,
    })
}

/// Whether a baseline is too stale to drive detection (spec.md §4.4: "never
/// used if staler than a configurable horizon").
pub fn is_stale(baseline: &Baseline, now: DateTime<Utc>, horizon_days: i64) -> bool {
    (now - baseline.computed_at) > Duration::days(horizon_days)
}

/// §4.17 "baselines_frozen": true when the most recent point for this
/// (user, metric) predates the disconnect threshold.
pub fn is_frozen(latest_point_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match latest_point_at {
        None => true,
        Some(ts) => (now - ts) > Duration::hours(DISCONNECT_THRESHOLD_HOURS),
    }
}

/// Compute baselines for every registered metric for `user`, partitioning
/// results the way the source's `compute_baselines_for_user` does: computed
/// vs explicitly skipped (insufficient data) vs failed (anything else).
pub struct BaselineSweep {
    pub computed: Vec<Baseline>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, BaselineErrorType)>,
}

pub fn compute_baselines_for_user(
    user: &str,
    points: &[HealthDataPoint],
    window_days: u32,
    now: DateTime<Utc>,
) -> BaselineSweep {
    let mut computed = Vec::new();
    let mut skipped = Vec::new();
    let mut failed = Vec::new();

    for metric_key in registry::list_metrics() {
        match recompute_baseline(user, metric_key, points, window_days, now) {
            Ok(b) => computed.push(b),
            Err(e) if e.error_type == BaselineErrorType::InsufficientData => {
                skipped.push(metric_key.to_string())
            }
            Err(e) => failed.push((metric_key.to_string(), e.error_type)),
        }
    }

    BaselineSweep {
        computed,
        skipped,
        failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn point(user: &str, metric: &str, value: f64, days_ago: i64, now: DateTime<Utc>) -> HealthDataPoint {
        HealthDataPoint {
            id: Uuid::new_v4(),
            user: user.to_string(),
            metric_key: metric.to_string(),
            value,
            unit: "minutes".to_string(),
            timestamp: now - Duration::days(days_ago),
            source: "whoop".to_string(),
            provenance_id: Uuid::new_v4(),
            quality_score: 0.9,
            flagged: false,
        }
    }

    #[test]
    fn four_points_is_insufficient_data() {
        let now = Utc.with_ymd_and_hms(2026, 1, 30, 0, 0, 0).unwrap();
        let points: Vec<_> = (0..4)
            .map(|d| point("u1", "sleep_duration", 420.0, d, now))
            .collect();
        let err = recompute_baseline("u1", "sleep_duration", &points, 30, now).unwrap_err();
        assert_eq!(err.error_type, BaselineErrorType::InsufficientData);
        assert!(err.recoverable);
    }

    #[test]
    fn five_points_succeeds() {
        let now = Utc.with_ymd_and_hms(2026, 1, 30, 0, 0, 0).unwrap();
        let points: Vec<_> = (0..5)
            .map(|d| point("u1", "sleep_duration", 420.0, d, now))
            .collect();
        let baseline = recompute_baseline("u1", "sleep_duration", &points, 30, now).unwrap();
        assert_eq!(baseline.sample_count, 5);
        assert_eq!(baseline.mean, 420.0);
    }

    #[test]
    fn unknown_metric_is_not_found() {
        let now = Utc::now();
        let err = recompute_baseline("u1", "not_a_metric", &[], 30, now).unwrap_err();
        assert_eq!(err.error_type, BaselineErrorType::MetricNotFound);
        assert!(!err.recoverable);
    }

    #[test]
    fn window_excludes_old_points() {
        let now = Utc.with_ymd_and_hms(2026, 1, 30, 0, 0, 0).unwrap();
        let mut points: Vec<_> = (0..5)
            .map(|d| point("u1", "sleep_duration", 420.0, d, now))
            .collect();
        points.push(point("u1", "sleep_duration", 10.0, 365, now));
        let baseline = recompute_baseline("u1", "sleep_duration", &points, 30, now).unwrap();
        assert_eq!(baseline.sample_count, 5);
        assert_eq!(baseline.mean, 420.0);
    }

    #[test]
    fn frozen_when_no_recent_point() {
        let now = Utc::now();
        assert!(is_frozen(None, now));
        assert!(is_frozen(Some(now - Duration::hours(49)), now));
        assert!(!is_frozen(Some(now - Duration::hours(10)), now));
    }

    #[test]
    fn stale_baseline_flagged() {
        let now = Utc::now();
        let baseline = Baseline {
            user: "u1".into(),
            metric_key: "sleep_duration".into(),
            mean: 0.0,
            std: 0.0,
            sample_count: 5,
            window_days: 30,
            computed_at: now - Duration::days(40),
        };
        assert!(is_stale(&baseline, now, 35));
        assert!(!is_stale(&baseline, now, 45));
    }

    #[test]
    fn sweep_partitions_results() {
        let now = Utc.with_ymd_and_hms(2026, 1, 30, 0, 0, 0).unwrap();
        let points: Vec<_> = (0..5)
            .map(|d| point("u1", "sleep_duration", 420.0, d, now))
            .collect();
        let sweep = compute_baselines_for_user("u1", &points, 30, now);
        assert!(sweep.computed.iter().any(|b| b.metric_key == "sleep_duration"));
        assert!(sweep.skipped.contains(&"resting_hr".to_string()));
    }
}
