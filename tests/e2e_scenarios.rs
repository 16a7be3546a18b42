//! End-to-end scenarios over the full analytics loop: consent gating,
//! detection, safety overrides, evaluation, and scheduler idempotency, all
//! driven against [`MemoryStore`] so the suite never touches a filesystem
//! database. Grounded on the canonical walkthroughs in
//! `original_source/backend/tests/e2e/test_golden_path.py`.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;
use vitalloop_core::config::Config;
use vitalloop_core::consent::ConsentError;
use vitalloop_core::models::{
    AdherenceEvent, Baseline, Consent, Direction, Experiment, ExperimentStatus, HealthDataPoint, InsightType, Verdict,
};
use vitalloop_core::scheduler::{self, DispatchOutcome};
use vitalloop_core::store::memory::MemoryStore;
use vitalloop_core::store::{BaselineRepository, ConsentRepository, HealthDataRepository};
use vitalloop_core::{evaluation, loop_runner};

fn consent_for(user: &str, data_analysis: bool, revoked: bool) -> Consent {
    Consent {
        user: user.to_string(),
        version: "v1".to_string(),
        data_analysis,
        experimental_recommendations: true,
        stop_anytime: true,
        provider_ingestion: BTreeMap::new(),
        revoked_at: if revoked { Some(Utc::now()) } else { None },
        recorded_at: Utc::now() - Duration::days(60),
    }
}

fn point(user: &str, metric: &str, value: f64, unit: &str, ts: DateTime<Utc>) -> HealthDataPoint {
    HealthDataPoint {
        id: Uuid::new_v4(),
        user: user.to_string(),
        metric_key: metric.to_string(),
        value,
        unit: unit.to_string(),
        timestamp: ts,
        source: "whoop".to_string(),
        provenance_id: Uuid::new_v4(),
        quality_score: 0.95,
        flagged: false,
    }
}

/// 1. Golden path: a baseline period in range followed by a 7-day
/// deviation on every tracked metric should surface a change insight per
/// deviated metric, each policy-valid with a domain_key that matches.
#[test]
fn golden_path_surfaces_one_change_insight_per_deviated_metric() {
    let store = MemoryStore::new();
    let user = "user-1".to_string();
    store.upsert_consent(&consent_for(&user, true, false)).unwrap();
    let now = Utc::now();
    let baseline_computed_at = now - Duration::days(7);

    // 30 days of in-range baseline data, ending right before the deviation window.
    let mut baseline_points = Vec::new();
    for d in 7..37i64 {
        let ts = now - Duration::days(d);
        baseline_points.push(point(&user, "sleep_duration", 400.0 + (d % 5) as f64 * 8.0, "minutes", ts));
        baseline_points.push(point(&user, "hrv_rmssd", 39.0 + (d % 4) as f64 * 3.0, "ms", ts));
        baseline_points.push(point(&user, "resting_hr", 60.0 + (d % 4) as f64, "bpm", ts));
    }
    for (metric, mean, std) in [("sleep_duration", 420.0, 11.0), ("hrv_rmssd", 44.0, 4.0), ("resting_hr", 62.0, 1.5)] {
        let baseline = vitalloop_core::baseline::recompute_baseline(&user, metric, &baseline_points, 30, baseline_computed_at)
            .unwrap_or(Baseline {
                user: user.clone(),
                metric_key: metric.to_string(),
                mean,
                std,
                sample_count: baseline_points.len(),
                window_days: 30,
                computed_at: baseline_computed_at,
            });
        store.upsert_baseline(&baseline).unwrap();
    }

    // 7 days of deviated data: sleep and HRV drop, resting HR rises.
    let mut deviation_points = Vec::new();
    for d in 0..7i64 {
        let ts = now - Duration::days(d);
        deviation_points.push(point(&user, "sleep_duration", 300.0 + (d % 3) as f64 * 10.0, "minutes", ts));
        deviation_points.push(point(&user, "hrv_rmssd", 30.0 + (d % 3) as f64 * 2.0, "ms", ts));
        deviation_points.push(point(&user, "resting_hr", 72.0 + (d % 3) as f64, "bpm", ts));
    }
    store.insert_points(&baseline_points).unwrap();
    store.insert_points(&deviation_points).unwrap();

    let outcome = loop_runner::run_loop_for_user(&store, &Config::default(), &user, now).unwrap();
    assert!(!outcome.safety_triggered);

    for (metric, domain) in [("sleep_duration", "sleep"), ("hrv_rmssd", "stress_nervous_system"), ("resting_hr", "cardiometabolic")] {
        let change = outcome
            .insights
            .iter()
            .find(|i| i.insight_type == InsightType::Change && i.metric_key == metric)
            .unwrap_or_else(|| panic!("expected a change insight for {metric}"));
        assert_eq!(change.domain_key, domain);
        assert!(change.policy_sanitized, "insight language must pass claim-policy validation");
        assert!((1..=5).contains(&change.claim_level));
    }
}

/// 2. Consent revoked: the consent gate rejects the run before anything
/// else happens, with a reason code that never distinguishes "no such
/// user" from "revoked".
#[test]
fn revoked_consent_blocks_the_loop_with_a_reason_code() {
    let store = MemoryStore::new();
    let user = "user-2".to_string();
    store.upsert_consent(&consent_for(&user, true, true)).unwrap();

    let err = loop_runner::run_loop_for_user(&store, &Config::default(), &user, Utc::now()).unwrap_err();
    let loop_runner::LoopRunError::Consent(consent_err) = err else { panic!("expected a consent error") };
    assert_eq!(consent_err, ConsentError::ConsentRevoked);
    assert_eq!(consent_err.reason_code(), "consent_revoked");
}

/// 3. Insufficient data: a metric with a baseline on file but too few
/// recent points yields exactly one insufficient_data insight and no
/// change insight, and the run still completes without error.
#[test]
fn sparse_recent_data_yields_insufficient_data_not_a_crash() {
    let store = MemoryStore::new();
    let user = "user-3".to_string();
    store.upsert_consent(&consent_for(&user, true, false)).unwrap();
    let now = Utc::now();

    store
        .upsert_baseline(&Baseline {
            user: user.clone(),
            metric_key: "sleep_duration".to_string(),
            mean: 420.0,
            std: 15.0,
            sample_count: 30,
            window_days: 30,
            computed_at: now - Duration::days(1),
        })
        .unwrap();
    // Only 3 points in the recent window, below the detector minimum.
    let points: Vec<_> = (0..3).map(|d| point(&user, "sleep_duration", 420.0, "minutes", now - Duration::hours(d))).collect();
    store.insert_points(&points).unwrap();

    let outcome = loop_runner::run_loop_for_user(&store, &Config::default(), &user, now).unwrap();
    let sleep_insights: Vec<_> = outcome.insights.iter().filter(|i| i.metric_key == "sleep_duration").collect();
    assert_eq!(sleep_insights.len(), 1);
    assert_eq!(sleep_insights[0].insight_type, InsightType::InsufficientData);
    assert!(!outcome.insights.iter().any(|i| i.insight_type == InsightType::Change));
}

/// 4. Safety override: a dangerously high resting heart rate produces
/// exactly one urgent safety insight and short-circuits the rest of the
/// detector pipeline for that run, even though a baseline is on file.
#[test]
fn safety_override_short_circuits_and_suppresses_other_detections() {
    let store = MemoryStore::new();
    let user = "user-4".to_string();
    store.upsert_consent(&consent_for(&user, true, false)).unwrap();
    let now = Utc::now();

    // A baseline for resting_hr exists, so if the safety gate did not
    // short-circuit, the detector pipeline would also fire on this metric.
    store
        .upsert_baseline(&Baseline {
            user: user.clone(),
            metric_key: "resting_hr".to_string(),
            mean: 62.0,
            std: 3.0,
            sample_count: 30,
            window_days: 30,
            computed_at: now - Duration::days(1),
        })
        .unwrap();
    let points: Vec<_> = (0..3).map(|d| point(&user, "resting_hr", 115.0, "bpm", now - Duration::days(d))).collect();
    store.insert_points(&points).unwrap();

    let outcome = loop_runner::run_loop_for_user(&store, &Config::default(), &user, now).unwrap();
    assert!(outcome.safety_triggered);
    assert_eq!(outcome.insights.len(), 1);
    let safety_insight = &outcome.insights[0];
    assert_eq!(safety_insight.insight_type, InsightType::Safety);
    assert_eq!(safety_insight.confidence, 1.0);
}

/// 5. Evaluation without adherence: a meaningful effect with zero logged
/// adherence events can never reach `helpful` — there is no way to confirm
/// the intervention was actually followed.
#[test]
fn evaluation_without_adherence_is_unclear_not_helpful() {
    let user = "user-5".to_string();
    let now = Utc::now();
    let experiment = Experiment {
        id: Uuid::new_v4(),
        user: user.clone(),
        intervention: "magnesium_glycinate".to_string(),
        primary_metric: "sleep_duration".to_string(),
        expected_direction: Some(Direction::Positive),
        started_at: now - Duration::days(14),
        ended_at: None,
        status: ExperimentStatus::Active,
        baseline_window_days: 14,
        intervention_window_days: 14,
    };

    // Day-to-day jitter keeps each window's variance nonzero so Cohen's d is
    // well-defined; a perfectly flat window collapses to d=0 regardless of
    // the gap between the two means.
    let mut points = Vec::new();
    for d in 0..28i64 {
        let ts = now - Duration::days(27 - d);
        let value = if d < 14 { 400.0 } else { 440.0 } + (d % 3) as f64 * 2.0;
        points.push(point(&user, "sleep_duration", value, "minutes", ts));
    }

    let result = evaluation::evaluate_experiment(&experiment, &points, &[], now, evaluation::DEFAULT_MIN_COVERAGE, evaluation::DEFAULT_MIN_POINTS);
    assert_eq!(result.verdict, Verdict::Unclear);
    assert!(result.details.reasons.iter().any(|r| r == "no_adherence_events_logged"));
    assert_eq!(result.adherence_rate, 0.0);
}

/// A logged-but-unverifiable adherence rate (events present, none taken)
/// still keeps the verdict from reaching `helpful`, distinct from the
/// "zero events at all" case above.
#[test]
fn evaluation_with_adherence_and_meaningful_effect_is_helpful() {
    let user = "user-5b".to_string();
    let now = Utc::now();
    let experiment = Experiment {
        id: Uuid::new_v4(),
        user: user.clone(),
        intervention: "magnesium_glycinate".to_string(),
        primary_metric: "sleep_duration".to_string(),
        expected_direction: Some(Direction::Positive),
        started_at: now - Duration::days(14),
        ended_at: None,
        status: ExperimentStatus::Active,
        baseline_window_days: 14,
        intervention_window_days: 14,
    };

    let mut points = Vec::new();
    let mut adherence = Vec::new();
    for d in 0..28i64 {
        let ts = now - Duration::days(27 - d);
        let value = if d < 14 { 400.0 } else { 450.0 } + (d % 3) as f64 * 2.0;
        points.push(point(&user, "sleep_duration", value, "minutes", ts));
        if d >= 14 {
            adherence.push(AdherenceEvent {
                id: Uuid::new_v4(),
                user: user.clone(),
                experiment: experiment.id,
                timestamp: ts,
                taken: true,
                dose: Some("200mg".to_string()),
            });
        }
    }

    let result =
        evaluation::evaluate_experiment(&experiment, &points, &adherence, now, evaluation::DEFAULT_MIN_COVERAGE, evaluation::DEFAULT_MIN_POINTS);
    assert_eq!(result.verdict, Verdict::Helpful);
    assert_eq!(result.adherence_rate, 1.0);
}

/// 6. Idempotent job: the same logical `run_insights` execution, called
/// twice inside its one-hour bucket, runs its work exactly once — the
/// second call reports the first run's id rather than an error.
#[test]
fn run_insights_called_twice_in_one_bucket_runs_once() {
    let store = MemoryStore::new();
    let user = "user-1".to_string();
    store.upsert_consent(&consent_for(&user, true, false)).unwrap();
    let now = Utc::now();
    let config = Config::default();

    let first = scheduler::dispatch_run_insights(&store, &config, now).unwrap();
    let DispatchOutcome::Ran(first_run) = first else { panic!("expected the first call to run") };

    let second = scheduler::dispatch_run_insights(&store, &config, now + Duration::minutes(10)).unwrap();
    match second {
        DispatchOutcome::Skipped { reason, previous_run_id } => {
            assert_eq!(reason, "idempotency_check");
            assert_eq!(previous_run_id, first_run.id);
        }
        DispatchOutcome::Ran(_) => panic!("second call within the same bucket should be skipped"),
    }
}
