//! C8: Detectors.
//!
//! Three deterministic detector families over `(recent values, baseline,
//! thresholds)`: change (z-score), trend (OLS slope), instability (variance
//! ratio). Grounded on
//! `original_source/backend/app/engine/analytics/{time_series,rolling_metrics}.py`
//! and the detector thresholds implied by spec.md §4.5.

use crate::models::Baseline;
use crate::stats;

pub const MIN_POINTS_CHANGE: usize = 5;
pub const MIN_POINTS_TREND: usize = 7;
pub const MIN_POINTS_INSTABILITY: usize = 7;

#[derive(Debug, Clone, Copy)]
pub struct DetectorThresholds {
    pub z_threshold: f64,
    pub slope_threshold: f64,
    pub instability_ratio_threshold: f64,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        // Matches the teacher's per-metric guardrail defaults generalized
        // across all metrics absent an override (spec.md §6 "per-metric
        // threshold overrides").
        DetectorThresholds {
            z_threshold: 1.5,
            slope_threshold: 0.5,
            instability_ratio_threshold: 1.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDetection {
    pub z_score: f64,
    pub recent_mean: f64,
    pub n_points: usize,
    pub window: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendDetection {
    pub slope: f64,
    pub n_points: usize,
    pub window: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstabilityDetection {
    pub ratio: f64,
    pub recent_std: f64,
    pub n_points: usize,
    pub window: usize,
}

/// z = (recent_mean - baseline.mean) / baseline.std; fires when |z| >=
/// threshold (spec.md §4.5, boundary behavior "z exactly at threshold
/// fires"). `None` below the minimum sample size or when baseline has zero
/// variance (z is undefined).
pub fn detect_change(
    recent_values: &[f64],
    baseline: &Baseline,
    thresholds: &DetectorThresholds,
) -> Option<ChangeDetection> {
    if recent_values.len() < MIN_POINTS_CHANGE || baseline.std <= 0.0 {
        return None;
    }
    let recent_mean = stats::mean(recent_values);
    let z = (recent_mean - baseline.mean) / baseline.std;
    if z.abs() >= thresholds.z_threshold {
        Some(ChangeDetection {
            z_score: z,
            recent_mean,
            n_points: recent_values.len(),
            window: recent_values.len(),
        })
    } else {
        None
    }
}

/// OLS slope over consecutive daily aggregates; fires when |slope| >=
/// threshold.
pub fn detect_trend(
    daily_values: &[f64],
    thresholds: &DetectorThresholds,
) -> Option<TrendDetection> {
    if daily_values.len() < MIN_POINTS_TREND {
        return None;
    }
    let slope = stats::ols_slope(daily_values);
    if slope.abs() >= thresholds.slope_threshold {
        Some(TrendDetection {
            slope,
            n_points: daily_values.len(),
            window: daily_values.len(),
        })
    } else {
        None
    }
}

/// recent stddev / baseline stddev; fires when ratio >= threshold.
pub fn detect_instability(
    recent_values: &[f64],
    baseline: &Baseline,
    thresholds: &DetectorThresholds,
) -> Option<InstabilityDetection> {
    if recent_values.len() < MIN_POINTS_INSTABILITY || baseline.std <= 0.0 {
        return None;
    }
    let recent_std = stats::pstdev(recent_values);
    let ratio = recent_std / baseline.std;
    if ratio >= thresholds.instability_ratio_threshold {
        Some(InstabilityDetection {
            ratio,
            recent_std,
            n_points: recent_values.len(),
            window: recent_values.len(),
        })
    } else {
        None
    }
}

/// §4.17 "intervention_suppressed": recent stddev more than double the
/// baseline's means attribution should skip this metric this cycle.
pub fn is_intervention_suppressed(recent_values: &[f64], baseline: &Baseline) -> bool {
    if recent_values.len() < 2 || baseline.std <= 0.0 {
        return false;
    }
    stats::pstdev(recent_values) > 2.0 * baseline.std
}
