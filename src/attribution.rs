//! C13: Cross-Signal Attribution Engine.
//!
//! Associates behaviors and interventions ("drivers") with metric outcomes
//! at a lag, using simple linear regression and Cohen's d, then gates each
//! candidate through the attribution guardrails (C10) before it is allowed
//! to become a [`PersonalDriver`]. Must never claim causality — output is
//! "associated with", enforced by [`crate::claim_policy`] at the narrative
//! layer, not here. Grounded on
//! `original_source/backend/app/engine/attribution/cross_signal_engine.py`
//! (`compute_personal_drivers`, `_build_feature_matrix`,
//! `_build_outcome_series`, `_compute_attribution`, `_simple_regression`,
//! `_compute_effect_size`, `_compute_stability`), with the driver/outcome
//! pairing table adapted from
//! `original_source/backend/app/engine/drivers/driver_discovery_service.py`
//! since the original driver registry module was not retrievable.

use crate::guardrails::apply_attribution_guardrails;
use crate::models::{AdherenceEvent, DailyCheckIn, Direction, Experiment, HealthDataPoint, PersonalDriver};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

const DEFAULT_WINDOW_DAYS: i64 = 28;
const STABILITY_WINDOW: usize = 7;
const FDR_ALPHA: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
pub struct DriverSpec {
    pub driver_type: &'static str,
    pub driver_key: &'static str,
    pub outcome_metric: &'static str,
    pub min_data_days: usize,
    pub max_lag_days: u32,
}

/// Drivers worth testing per outcome metric. Behaviors come from
/// `DailyCheckIn.behaviors`; interventions come from `AdherenceEvent` via
/// the experiment it belongs to.
static DRIVER_SPECS: &[DriverSpec] = &[
    DriverSpec { driver_type: "behavior", driver_key: "caffeine_after_2pm", outcome_metric: "sleep_duration", min_data_days: 14, max_lag_days: 1 },
    DriverSpec { driver_type: "behavior", driver_key: "caffeine_after_2pm", outcome_metric: "sleep_efficiency", min_data_days: 14, max_lag_days: 1 },
    DriverSpec { driver_type: "behavior", driver_key: "alcohol", outcome_metric: "hrv_rmssd", min_data_days: 14, max_lag_days: 1 },
    DriverSpec { driver_type: "behavior", driver_key: "alcohol", outcome_metric: "sleep_efficiency", min_data_days: 14, max_lag_days: 1 },
    DriverSpec { driver_type: "behavior", driver_key: "exercise_intensity", outcome_metric: "resting_hr", min_data_days: 14, max_lag_days: 2 },
    DriverSpec { driver_type: "behavior", driver_key: "exercise_intensity", outcome_metric: "sleep_quality", min_data_days: 14, max_lag_days: 1 },
    DriverSpec { driver_type: "behavior", driver_key: "screen_time_evening", outcome_metric: "sleep_duration", min_data_days: 14, max_lag_days: 1 },
    DriverSpec { driver_type: "behavior", driver_key: "stress_event", outcome_metric: "hrv_rmssd", min_data_days: 14, max_lag_days: 1 },
    DriverSpec { driver_type: "intervention", driver_key: "magnesium_glycinate", outcome_metric: "sleep_quality", min_data_days: 14, max_lag_days: 2 },
    DriverSpec { driver_type: "intervention", driver_key: "melatonin", outcome_metric: "sleep_duration", min_data_days: 14, max_lag_days: 1 },
    DriverSpec { driver_type: "intervention", driver_key: "melatonin", outcome_metric: "sleep_efficiency", min_data_days: 14, max_lag_days: 1 },
];

pub fn get_drivers_for_outcome(outcome_metric: &str) -> Vec<&'static DriverSpec> {
    DRIVER_SPECS.iter().filter(|d| d.outcome_metric == outcome_metric).collect()
}

fn outcome_metrics() -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = DRIVER_SPECS.iter().map(|d| d.outcome_metric).collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

/// Builds `{date: {driver_key: value}}` from check-in behaviors and taken
/// adherence events, keyed by the experiment's intervention key.
fn build_feature_matrix(
    checkins: &[DailyCheckIn],
    adherence_events: &[AdherenceEvent],
    experiments: &[Experiment],
    start: NaiveDate,
    end: NaiveDate,
) -> BTreeMap<NaiveDate, BTreeMap<String, f64>> {
    let mut matrix: BTreeMap<NaiveDate, BTreeMap<String, f64>> = BTreeMap::new();

    for checkin in checkins {
        if checkin.date < start || checkin.date > end {
            continue;
        }
        let entry = matrix.entry(checkin.date).or_default();
        for (key, value) in &checkin.behaviors {
            entry.insert(key.clone(), *value);
        }
    }

    let experiment_key: BTreeMap<Uuid, String> =
        experiments.iter().map(|e| (e.id, e.intervention.clone())).collect();

    for event in adherence_events {
        let event_date = event.timestamp.date_naive();
        if event_date < start || event_date > end {
            continue;
        }
        let Some(intervention_key) = experiment_key.get(&event.experiment) else { continue };
        matrix
            .entry(event_date)
            .or_default()
            .insert(intervention_key.clone(), if event.taken { 1.0 } else { 0.0 });
    }

    matrix
}

/// Builds `{metric_key: [(date, daily_mean)]}` from all points in the
/// window, sorted ascending by date.
fn build_outcome_series(
    points: &[HealthDataPoint],
    start: NaiveDate,
    end: NaiveDate,
) -> BTreeMap<String, Vec<(NaiveDate, f64)>> {
    let mut daily: BTreeMap<String, BTreeMap<NaiveDate, Vec<f64>>> = BTreeMap::new();
    for point in points {
        let d = point.timestamp.date_naive();
        if d < start || d > end {
            continue;
        }
        daily.entry(point.metric_key.clone()).or_default().entry(d).or_default().push(point.value);
    }

    daily
        .into_iter()
        .map(|(metric, by_day)| {
            let series: Vec<(NaiveDate, f64)> = by_day
                .into_iter()
                .map(|(d, values)| (d, values.iter().sum::<f64>() / values.len() as f64))
                .collect();
            (metric, series)
        })
        .collect()
}

/// Exact match, else linear interpolation between nearest neighbors, else
/// nearest single-sided neighbor.
fn outcome_value_at(series: &[(NaiveDate, f64)], target: NaiveDate) -> Option<f64> {
    if let Some((_, v)) = series.iter().find(|(d, _)| *d == target) {
        return Some(*v);
    }
    let before = series.iter().filter(|(d, _)| *d < target).max_by_key(|(d, _)| *d);
    let after = series.iter().filter(|(d, _)| *d > target).min_by_key(|(d, _)| *d);
    match (before, after) {
        (Some((d0, v0)), Some((d1, v1))) => {
            let span = (*d1 - *d0).num_days();
            if span > 0 {
                let weight = (target - *d0).num_days() as f64 / span as f64;
                Some(v0 + (v1 - v0) * weight)
            } else {
                Some(*v0)
            }
        }
        (Some((_, v0)), None) => Some(*v0),
        (None, Some((_, v1))) => Some(*v1),
        (None, None) => None,
    }
}

/// Cohen's d between days where `x > 0` ("exposed") and days where `x ==
/// 0` ("unexposed"), using population variance pooled unweighted, matching
/// the source exactly (not [`crate::stats::cohens_d`]'s sample-variance
/// form, which assumes two pre-split independent samples).
fn effect_size_from_exposure(x: &[f64], y: &[f64]) -> f64 {
    let exposed: Vec<f64> = x.iter().zip(y).filter(|(xi, _)| **xi > 0.0).map(|(_, yi)| *yi).collect();
    let unexposed: Vec<f64> = x.iter().zip(y).filter(|(xi, _)| **xi == 0.0).map(|(_, yi)| *yi).collect();
    if exposed.is_empty() || unexposed.is_empty() {
        return 0.0;
    }
    let mean_exposed = exposed.iter().sum::<f64>() / exposed.len() as f64;
    let mean_unexposed = unexposed.iter().sum::<f64>() / unexposed.len() as f64;
    let var_exposed = exposed.iter().map(|v| (v - mean_exposed).powi(2)).sum::<f64>() / exposed.len() as f64;
    let var_unexposed = unexposed.iter().map(|v| (v - mean_unexposed).powi(2)).sum::<f64>() / unexposed.len() as f64;
    let pooled_std = ((var_exposed + var_unexposed) / 2.0).sqrt();
    if pooled_std == 0.0 {
        return 0.0;
    }
    (mean_exposed - mean_unexposed) / pooled_std
}

/// Consistency of the exposure effect across rolling 7-day sub-windows,
/// expressed as `1 - coefficient_of_variation`, clamped to `[0,1]`.
/// Returns 0.5 ("unknown") when there isn't enough data for two windows.
fn compute_stability(x: &[f64], y: &[f64]) -> f64 {
    if x.len() < STABILITY_WINDOW * 2 {
        return 0.5;
    }
    let mut effects = Vec::new();
    for i in 0..=(x.len() - STABILITY_WINDOW) {
        let xw = &x[i..i + STABILITY_WINDOW];
        let yw = &y[i..i + STABILITY_WINDOW];
        let distinct = xw.iter().fold(Vec::<f64>::new(), |mut acc, v| {
            if !acc.contains(v) {
                acc.push(*v);
            }
            acc
        });
        if distinct.len() < 2 {
            continue;
        }
        let effect = effect_size_from_exposure(xw, yw);
        if !effect.is_nan() {
            effects.push(effect);
        }
    }
    if effects.len() < 2 {
        return 0.5;
    }
    let mean_effect = effects.iter().sum::<f64>() / effects.len() as f64;
    if mean_effect == 0.0 {
        return 0.5;
    }
    let std_effect = (effects.iter().map(|e| (e - mean_effect).powi(2)).sum::<f64>() / effects.len() as f64).sqrt();
    let cv = (std_effect / mean_effect).abs();
    (1.0 - cv).clamp(0.0, 1.0)
}

#[allow(clippy::too_many_arguments)]
fn compute_attribution(
    driver_spec: &DriverSpec,
    outcome_metric: &str,
    lag_days: u32,
    feature_matrix: &BTreeMap<NaiveDate, BTreeMap<String, f64>>,
    outcome_series: &[(NaiveDate, f64)],
    start: NaiveDate,
    end: NaiveDate,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Option<PersonalDriver> {
    let mut driver_values = Vec::new();
    let mut outcome_values = Vec::new();

    let mut current = start;
    while current <= end {
        let outcome_date = current;
        let driver_date = current - Duration::days(lag_days as i64);
        let Some(outcome_val) = outcome_value_at(outcome_series, outcome_date) else {
            current += Duration::days(1);
            continue;
        };
        let driver_val = feature_matrix
            .get(&driver_date)
            .and_then(|day| day.get(driver_spec.driver_key))
            .copied()
            .unwrap_or(0.0);
        driver_values.push(driver_val);
        outcome_values.push(outcome_val);
        current += Duration::days(1);
    }

    if driver_values.len() < driver_spec.min_data_days {
        return None;
    }
    let distinct: std::collections::BTreeSet<u64> =
        driver_values.iter().map(|v| v.to_bits()).collect();
    if distinct.len() < 2 {
        return None;
    }

    let (_alpha, _beta, r_squared) = crate::stats::linreg(&driver_values, &outcome_values);
    if r_squared.is_nan() {
        return None;
    }

    let effect_size = effect_size_from_exposure(&driver_values, &outcome_values);
    let direction = if effect_size.abs() < 0.1 {
        Direction::Neutral
    } else if effect_size > 0.0 {
        Direction::Positive
    } else {
        Direction::Negative
    };

    let variance_explained = r_squared.clamp(0.0, 1.0);
    let stability = compute_stability(&driver_values, &outcome_values);

    let coverage = driver_values.iter().filter(|v| **v > 0.0).count() as f64 / driver_values.len() as f64;
    let effect_magnitude = (effect_size.abs() / 2.0).min(1.0);
    let base_confidence = (coverage * 0.3 + effect_magnitude * 0.4 + stability * 0.3).clamp(0.0, 1.0);

    let n_comparisons = get_drivers_for_outcome(outcome_metric).len() * (driver_spec.max_lag_days as usize + 1);
    let guardrail = apply_attribution_guardrails(
        effect_size,
        base_confidence,
        stability,
        variance_explained,
        driver_values.len(),
        n_comparisons,
        r_squared,
        FDR_ALPHA,
    );
    if !guardrail.passed {
        return None;
    }

    Some(PersonalDriver {
        id: Uuid::new_v4(),
        user: String::new(), // filled in by the caller, which knows the user
        driver_key: driver_spec.driver_key.to_string(),
        driver_type: driver_spec.driver_type.to_string(),
        outcome_metric: outcome_metric.to_string(),
        lag_days,
        effect_size,
        direction,
        variance_explained,
        confidence: guardrail.adjusted_confidence,
        stability,
        sample_size: driver_values.len(),
        window_start,
        window_end,
        label: guardrail.label.map(|l| format!("{l:?}")),
    })
}

/// Recomputes every personal driver for `user` over the trailing
/// `window_days` (default 28), replacing the prior set (spec.md §4.10:
/// "idempotent per run — always derived fresh from raw data, never
/// incrementally updated").
pub fn compute_personal_drivers(
    user: &str,
    now: DateTime<Utc>,
    checkins: &[DailyCheckIn],
    adherence_events: &[AdherenceEvent],
    experiments: &[Experiment],
    points: &[HealthDataPoint],
    window_days: Option<i64>,
) -> Vec<PersonalDriver> {
    let window_days = window_days.unwrap_or(DEFAULT_WINDOW_DAYS);
    let end = now.date_naive();
    let start = end - Duration::days(window_days);
    let window_start = now - Duration::days(window_days);

    let user_checkins: Vec<DailyCheckIn> = checkins.iter().filter(|c| c.user == user).cloned().collect();
    let user_events: Vec<AdherenceEvent> = adherence_events.iter().filter(|e| e.user == user).cloned().collect();
    let user_experiments: Vec<Experiment> = experiments.iter().filter(|e| e.user == user).cloned().collect();
    let user_points: Vec<HealthDataPoint> = points.iter().filter(|p| p.user == user).cloned().collect();

    let feature_matrix = build_feature_matrix(&user_checkins, &user_events, &user_experiments, start, end);
    let outcome_series = build_outcome_series(&user_points, start, end);

    let mut drivers = Vec::new();
    for outcome_metric in outcome_metrics() {
        let Some(series) = outcome_series.get(outcome_metric) else { continue };
        for driver_spec in get_drivers_for_outcome(outcome_metric) {
            for lag_days in 0..=driver_spec.max_lag_days {
                if let Some(mut driver) = compute_attribution(
                    driver_spec,
                    outcome_metric,
                    lag_days,
                    &feature_matrix,
                    series,
                    start,
                    end,
                    window_start,
                    now,
                ) {
                    driver.user = user.to_string();
                    drivers.push(driver);
                }
            }
        }
    }
    drivers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};
    use uuid::Uuid as UuidT;

    fn checkin(user: &str, date: NaiveDate, caffeine: f64) -> DailyCheckIn {
        let mut behaviors = BTreeMap::new();
        behaviors.insert("caffeine_after_2pm".to_string(), caffeine);
        DailyCheckIn { user: user.to_string(), date, behaviors, symptom_tags: vec![], notes_present: false }
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
    fn no_drivers_without_enough_data() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
        let drivers = compute_personal_drivers("u1", now, &[], &[], &[], &[], None);
        assert!(drivers.is_empty());
    }

    #[test]
    fn finds_caffeine_sleep_association_with_enough_contrast() {
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
        let start = now.date_naive() - Duration::days(28);
        let mut checkins = Vec::new();
        let mut points = Vec::new();
        let mut d = start;
        let mut i = 0;
        while d <= now.date_naive() {
            let caffeine = if i % 2 == 0 { 1.0 } else { 0.0 };
            checkins.push(checkin("u1", d, caffeine));
            let sleep_minutes = if caffeine > 0.0 { 360.0 } else { 440.0 };
            let ts = Utc.with_ymd_and_hms(d.year(), d.month(), d.day(), 7, 0, 0).unwrap();
            points.push(point("u1", "sleep_duration", sleep_minutes, ts));
            d += Duration::days(1);
            i += 1;
        }
        let drivers = compute_personal_drivers("u1", now, &checkins, &[], &[], &points, None);
        assert!(drivers.iter().any(|dr| dr.driver_key == "caffeine_after_2pm" && dr.outcome_metric == "sleep_duration"));
    }

    #[test]
    fn effect_size_is_zero_without_variation() {
        let x = vec![1.0, 1.0, 1.0];
        let y = vec![10.0, 20.0, 30.0];
        assert_eq!(effect_size_from_exposure(&x, &y), 0.0);
    }

    #[test]
    fn stability_defaults_to_half_with_sparse_data() {
        let x = vec![1.0, 0.0, 1.0];
        let y = vec![10.0, 20.0, 15.0];
        assert_eq!(compute_stability(&x, &y), 0.5);
    }

    #[test]
    fn outcome_interpolates_missing_day() {
        let series = vec![(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), 0.0), (NaiveDate::from_ymd_opt(2026, 1, 3).unwrap(), 10.0)];
        let value = outcome_value_at(&series, NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
        assert_eq!(value, Some(5.0));
    }
}
