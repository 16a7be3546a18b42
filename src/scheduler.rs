//! C19: Scheduler.
//!
//! Cron-like periodic execution of the eight named jobs (spec.md §4.16),
//! each wrapped in an idempotency guard so the same logical run never
//! executes twice. The teacher has no scheduler of its own (it's a
//! desktop app with no background jobs) so this module is grounded on
//! `original_source/backend/app/scheduler/jobs.py` and
//! `original_source/backend/app/scheduler/idempotency.py`, translated
//! into the "explicit scheduler run-record creation + completion check,
//! inlined once in the job dispatcher" replacement spec.md §9 calls for
//! (no decorator, since Rust has none).
//!
//! `run_job` is the one place that touches [`crate::store::JobRunRepository`];
//! the `dispatch_*` functions below it wire one job's actual work (calling
//! into the rest of the crate) through that guard. Everything here is
//! synchronous — spec.md §5 puts the async boundary at the scheduler's
//! worker loop (`tokio`, wired in `main.rs`), not inside the jobs
//! themselves.

use crate::attribution;
use crate::baseline;
use crate::causal_memory;
use crate::config::Config;
use crate::consent::{self, ConsentScope};
use crate::crypto;
use crate::evaluation;
use crate::models::{ExperimentStatus, JobRun, JobStatus, PeriodType, Verdict};
use crate::narrative;
use crate::registry;
use crate::store::{Repository, StoreError};
use crate::trust;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::{json, Value as Json};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    RunInsights,
    RecomputeBaselines,
    EvaluateDueExperiments,
    SyncProviders,
    RecomputePersonalDrivers,
    GenerateDailyNarrative,
    WeeklyTrustRollup,
    DispatchNotifications,
}

impl JobKind {
    /// The `job_id` string persisted on [`JobRun`] and used in the
    /// idempotency key, matching spec.md §4.16's job names verbatim.
    pub fn job_id(&self) -> &'static str {
        match self {
            JobKind::RunInsights => "run_insights",
            JobKind::RecomputeBaselines => "recompute_baselines",
            JobKind::EvaluateDueExperiments => "evaluate_due_experiments",
            JobKind::SyncProviders => "sync_providers",
            JobKind::RecomputePersonalDrivers => "recompute_personal_drivers",
            JobKind::GenerateDailyNarrative => "generate_daily_narrative",
            JobKind::WeeklyTrustRollup => "weekly_trust_rollup",
            JobKind::DispatchNotifications => "dispatch_notifications",
        }
    }

    /// The idempotency bucket width: two calls whose `now` falls in the
    /// same bucket for this job collapse to one execution. Matches the
    /// cadence spec.md §4.16 documents for each job.
    pub fn bucket_window(&self) -> Duration {
        match self {
            JobKind::RunInsights => Duration::hours(1),
            JobKind::RecomputeBaselines => Duration::days(1),
            JobKind::EvaluateDueExperiments => Duration::days(1),
            JobKind::SyncProviders => Duration::hours(6),
            JobKind::RecomputePersonalDrivers => Duration::days(1),
            JobKind::GenerateDailyNarrative => Duration::days(1),
            JobKind::WeeklyTrustRollup => Duration::weeks(1),
            JobKind::DispatchNotifications => Duration::minutes(15),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// A completed run with the same idempotency key already exists
    /// (or one raced us into existing between our lookup and insert);
    /// spec.md §7 "IdempotencySkip: not an error".
    Skipped { reason: &'static str, previous_run_id: Uuid },
    Ran(JobRun),
}

/// `bucket(now, window)` from spec.md §4.16: the number of whole
/// `window`-sized buckets since the Unix epoch that `now` falls into.
/// Two timestamps in the same bucket hash identically.
fn bucket(now: DateTime<Utc>, window: Duration) -> i64 {
    let window_s = window.num_seconds().max(1);
    now.timestamp().div_euclid(window_s)
}

/// `key = hash(job_id, params, bucket(now, window))`, spec.md §4.16.
pub fn idempotency_key(job_id: &str, params: &Json, now: DateTime<Utc>, window: Duration) -> String {
    let payload = format!("{job_id}|{params}|{}", bucket(now, window));
    crypto::hash_sha256(payload.as_bytes())
}

/// Runs `work` under the idempotency guard for `job_id`/`params`/`now`.
/// Checks for a prior run with the same key first; if none is found,
/// creates a `pending` record, promotes it to `running`, executes `work`,
/// and records `completed`/`failed` with duration and result summary. A
/// unique-constraint collision on insert (another worker raced us) is
/// treated as the job having already started and skipped, not an error
/// (spec.md §4.16 "On unique-constraint collision ... treat as concurrent
/// execution and skip").
pub fn run_job<F>(
    repo: &dyn Repository,
    job_id: &str,
    params: &Json,
    now: DateTime<Utc>,
    window: Duration,
    work: F,
) -> Result<DispatchOutcome, SchedulerError>
where
    F: FnOnce() -> Result<String, String>,
{
    let key = idempotency_key(job_id, params, now, window);
    if let Some(prior) = repo.find_by_idempotency_key(&key)? {
        return Ok(DispatchOutcome::Skipped { reason: "idempotency_check", previous_run_id: prior.id });
    }

    let mut run = JobRun {
        id: Uuid::new_v4(),
        job_id: job_id.to_string(),
        idempotency_key: key.clone(),
        status: JobStatus::Pending,
        started_at: None,
        completed_at: None,
        duration_ms: None,
        result_summary: None,
        error: None,
    };
    if let Err(e) = repo.insert_job_run(&run) {
        if let Some(prior) = repo.find_by_idempotency_key(&key)? {
            return Ok(DispatchOutcome::Skipped { reason: "idempotency_check", previous_run_id: prior.id });
        }
        return Err(e.into());
    }

    run.status = JobStatus::Running;
    run.started_at = Some(now);
    repo.update_job_run(&run)?;

    let clock = std::time::Instant::now();
    match work() {
        Ok(summary) => {
            run.status = JobStatus::Completed;
            run.result_summary = Some(summary);
        }
        Err(err) => {
            run.status = JobStatus::Failed;
            run.error = Some(err);
            log::warn!("job_failed job_id={job_id} error={}", run.error.as_deref().unwrap_or(""));
        }
    }
    run.completed_at = Some(now);
    run.duration_ms = Some(clock.elapsed().as_millis() as i64);
    repo.update_job_run(&run)?;
    Ok(DispatchOutcome::Ran(run))
}

/// Every user who could conceivably be processed: anyone with a consent
/// record at all (spec.md §6 comment on [`crate::store::ConsentRepository::all_users`]).
/// Per-user jobs still run the Consent Gate themselves — this just bounds
/// the iteration, it doesn't replace the gate.
fn candidate_users(repo: &dyn Repository) -> Result<Vec<String>, SchedulerError> {
    Ok(repo.all_users()?)
}

/// `run_insights`: C11 loop runner for every consenting user, hourly.
pub fn dispatch_run_insights(repo: &dyn Repository, config: &Config, now: DateTime<Utc>) -> Result<DispatchOutcome, SchedulerError> {
    let job = JobKind::RunInsights;
    let params = json!({});
    run_job(repo, job.job_id(), &params, now, job.bucket_window(), || {
        let mut ran = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        for user in candidate_users(repo).map_err(|e| e.to_string())? {
            match crate::loop_runner::run_loop_for_user(repo, config, &user, now) {
                Ok(outcome) => {
                    ran += 1;
                    log::info!("loop_run user={} insights={} safety={}", user, outcome.insights.len(), outcome.safety_triggered);
                }
                Err(crate::loop_runner::LoopRunError::Consent(_)) => skipped += 1,
                Err(e) => {
                    failed += 1;
                    log::warn!("loop_run_failed user={user} error={e}");
                }
            }
        }
        Ok(format!("ran={ran} skipped_no_consent={skipped} failed={failed}"))
    })
}

/// `recompute_baselines`: nightly C7 sweep over every registered metric
/// for every user with health data on file.
pub fn dispatch_recompute_baselines(repo: &dyn Repository, config: &Config, now: DateTime<Utc>) -> Result<DispatchOutcome, SchedulerError> {
    let job = JobKind::RecomputeBaselines;
    let params = json!({});
    run_job(repo, job.job_id(), &params, now, job.bucket_window(), || {
        let mut computed = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        for user in candidate_users(repo).map_err(|e| e.to_string())? {
            let points = repo.all_points_for_user(&user).map_err(|e| e.to_string())?;
            let sweep = baseline::compute_baselines_for_user(&user, &points, config.assessment_days, now);
            for b in &sweep.computed {
                repo.upsert_baseline(b).map_err(|e| e.to_string())?;
            }
            computed += sweep.computed.len();
            skipped += sweep.skipped.len();
            failed += sweep.failed.len();
        }
        Ok(format!("computed={computed} skipped={skipped} failed={failed}"))
    })
}

/// `evaluate_due_experiments`: C14 evaluation for every active experiment
/// whose baseline window has already elapsed.
pub fn dispatch_evaluate_due_experiments(repo: &dyn Repository, now: DateTime<Utc>) -> Result<DispatchOutcome, SchedulerError> {
    let job = JobKind::EvaluateDueExperiments;
    let params = json!({});
    run_job(repo, job.job_id(), &params, now, job.bucket_window(), || {
        let mut evaluated = 0usize;
        for experiment in repo.all_active_experiments().map_err(|e| e.to_string())? {
            if experiment.started_at > now {
                continue;
            }
            let points = repo
                .points_in_window(
                    &experiment.user,
                    &experiment.primary_metric,
                    experiment.started_at - Duration::days(experiment.baseline_window_days as i64),
                    now,
                )
                .map_err(|e| e.to_string())?;
            let adherence = repo.adherence_for_experiment(experiment.id).map_err(|e| e.to_string())?;
            let result = evaluation::evaluate_experiment(&experiment, &points, &adherence, now, 0.5, 3);
            repo.insert_evaluation(&result).map_err(|e| e.to_string())?;

            let prior = repo
                .get_causal_memory(&experiment.user, &experiment.intervention, &experiment.primary_metric)
                .map_err(|e| e.to_string())?;
            let memory_update = causal_memory::update_from_evaluation(prior.as_ref(), &result, &experiment.intervention, now);
            if let Some(deprecated) = memory_update.deprecated {
                repo.upsert_causal_memory(&deprecated).map_err(|e| e.to_string())?;
            }
            repo.upsert_causal_memory(&memory_update.updated).map_err(|e| e.to_string())?;
            evaluated += 1;
        }
        Ok(format!("evaluated={evaluated}"))
    })
}

/// `recompute_personal_drivers`: nightly C13 attribution recompute,
/// wholesale-replacing each user's driver set.
pub fn dispatch_recompute_personal_drivers(repo: &dyn Repository, now: DateTime<Utc>) -> Result<DispatchOutcome, SchedulerError> {
    let job = JobKind::RecomputePersonalDrivers;
    let params = json!({});
    run_job(repo, job.job_id(), &params, now, job.bucket_window(), || {
        let mut total_drivers = 0usize;
        let mut paused = 0usize;
        for user in candidate_users(repo).map_err(|e| e.to_string())? {
            let window_start = now - Duration::days(28);
            let points = repo.all_points_for_user(&user).map_err(|e| e.to_string())?;
            // §4.17 paused_learning: skip attribution updates this cycle when
            // recent batch quality has been poor (approximated here by recent
            // flagged-point share, since the scheduler doesn't re-run C4 on
            // already-ingested data).
            let recent: Vec<_> = points.iter().filter(|p| p.timestamp >= window_start).collect();
            if !recent.is_empty() {
                let flagged = recent.iter().filter(|p| p.flagged).count() as f64;
                if flagged / recent.len() as f64 > 0.4 {
                    paused += 1;
                    continue;
                }
            }
            let checkins = repo.checkins_in_window(&user, window_start, now).map_err(|e| e.to_string())?;
            let experiments = repo.experiments_with_status(&user, ExperimentStatus::Active).map_err(|e| e.to_string())?;
            let mut adherence = Vec::new();
            for e in &experiments {
                adherence.extend(repo.adherence_for_experiment(e.id).map_err(|e| e.to_string())?);
            }
            let mut drivers = attribution::compute_personal_drivers(&user, now, &checkins, &adherence, &experiments, &points, None);
            for d in &mut drivers {
                d.user = user.clone();
            }
            total_drivers += drivers.len();
            repo.replace_drivers(&user, &drivers).map_err(|e| e.to_string())?;
        }
        Ok(format!("drivers={total_drivers} paused_users={paused}"))
    })
}

/// `generate_daily_narrative`: C16 synthesis for the UTC calendar day
/// preceding `now`.
pub fn dispatch_generate_daily_narrative(repo: &dyn Repository, now: DateTime<Utc>) -> Result<DispatchOutcome, SchedulerError> {
    let job = JobKind::GenerateDailyNarrative;
    let params = json!({});
    run_job(repo, job.job_id(), &params, now, job.bucket_window(), || {
        let period_end = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        let period_start = period_end - Duration::days(1);
        let mut generated = 0usize;
        for user in candidate_users(repo).map_err(|e| e.to_string())? {
            let insights = repo.insights_since(&user, period_start - Duration::days(1)).map_err(|e| e.to_string())?;
            let evaluations = repo.evaluations_for_user(&user).map_err(|e| e.to_string())?;
            let checkins = repo.checkins_in_window(&user, period_start, period_end).map_err(|e| e.to_string())?;
            let experiments = repo.experiments_with_status(&user, ExperimentStatus::Active).map_err(|e| e.to_string())?;
            let mut adherence = Vec::new();
            for e in &experiments {
                adherence.extend(repo.adherence_for_experiment(e.id).map_err(|e| e.to_string())?);
            }
            let drivers = repo.drivers_for_user(&user).map_err(|e| e.to_string())?;
            let mut present_metrics = Vec::new();
            let mut baselines = Vec::new();
            for metric_key in registry::list_metrics() {
                if repo.latest_point(&user, metric_key).map_err(|e| e.to_string())?.is_some() {
                    present_metrics.push(metric_key.to_string());
                }
                if let Some(b) = repo.get_baseline(&user, metric_key).map_err(|e| e.to_string())? {
                    baselines.push(b);
                }
            }

            let narrative = narrative::synthesize_narrative(
                &user,
                PeriodType::Daily,
                period_start,
                period_end,
                &insights,
                &evaluations,
                &checkins,
                &adherence,
                &drivers,
                &present_metrics,
                &baselines,
            );
            repo.upsert_narrative(&narrative).map_err(|e| e.to_string())?;
            generated += 1;
        }
        Ok(format!("narratives={generated}"))
    })
}

/// `weekly_trust_rollup`: C17, over the trailing 30 days of data per
/// spec.md §4.14 regardless of the weekly cadence of the job itself.
pub fn dispatch_weekly_trust_rollup(repo: &dyn Repository, now: DateTime<Utc>) -> Result<DispatchOutcome, SchedulerError> {
    let job = JobKind::WeeklyTrustRollup;
    let params = json!({});
    run_job(repo, job.job_id(), &params, now, job.bucket_window(), || {
        let mut rolled_up = 0usize;
        for user in candidate_users(repo).map_err(|e| e.to_string())? {
            let points = repo.all_points_for_user(&user).map_err(|e| e.to_string())?;
            let experiments = repo.experiments_with_status(&user, ExperimentStatus::Active).map_err(|e| e.to_string())?;
            let mut adherence = Vec::new();
            for e in &experiments {
                adherence.extend(repo.adherence_for_experiment(e.id).map_err(|e| e.to_string())?);
            }
            let evaluations = repo.evaluations_for_user(&user).map_err(|e| e.to_string())?;
            let verdicts: Vec<Verdict> = evaluations.iter().map(|e| e.verdict).collect();
            let memories = repo.causal_memories_for_user(&user).map_err(|e| e.to_string())?;
            let score = trust::compute_trust_score(&user, &points, &adherence, &verdicts, &memories, now);
            repo.upsert_trust_score(&score).map_err(|e| e.to_string())?;
            rolled_up += 1;
        }
        Ok(format!("users={rolled_up}"))
    })
}

/// `sync_providers`: the actual vendor HTTP call is an out-of-scope
/// external collaborator (spec.md §1); this wrapper is the scheduler-side
/// half of the contract — it only decides *which* (user, provider) pairs
/// are due and checks consent for each, handing the rest to `syncer`.
pub trait ProviderSyncer {
    /// Attempts one sync for `(user, provider)`; returns the number of
    /// points ingested, or an error message. Implementations live outside
    /// this crate (HTTP adapters); see spec.md §6 "Ingestion contract".
    fn sync(&self, user: &str, provider: &str) -> Result<usize, String>;
}

pub fn dispatch_sync_providers(
    repo: &dyn Repository,
    syncer: &dyn ProviderSyncer,
    now: DateTime<Utc>,
) -> Result<DispatchOutcome, SchedulerError> {
    let job = JobKind::SyncProviders;
    let params = json!({});
    run_job(repo, job.job_id(), &params, now, job.bucket_window(), || {
        let mut synced = 0usize;
        let mut skipped = 0usize;
        for user in candidate_users(repo).map_err(|e| e.to_string())? {
            let Some(consent) = repo.latest_consent(&user).map_err(|e| e.to_string())? else { continue };
            let providers: Vec<String> = consent.provider_ingestion.iter().filter(|(_, &allowed)| allowed).map(|(p, _)| p.clone()).collect();
            for provider in providers {
                if consent::require_scope(&consent, ConsentScope::ProviderIngestion(provider.clone())).is_err() {
                    skipped += 1;
                    continue;
                }
                match syncer.sync(&user, &provider) {
                    Ok(n) => {
                        synced += n;
                        log::info!("provider_synced user={user} provider={provider} points={n}");
                    }
                    Err(e) => log::warn!("provider_sync_failed user={user} provider={provider} error={e}"),
                }
            }
        }
        Ok(format!("points_synced={synced} skipped={skipped}"))
    })
}

/// `dispatch_notifications`: frequent, low-latency fan-out of freshly
/// surfaced (non-suppressed) insights to whatever notification channel
/// the caller wires in. Like provider sync, the channel itself is an
/// external collaborator; this job only decides what's due.
pub trait NotificationSink {
    fn notify(&self, user: &str, insight_title: &str) -> Result<(), String>;
}

pub fn dispatch_notifications(
    repo: &dyn Repository,
    sink: &dyn NotificationSink,
    now: DateTime<Utc>,
) -> Result<DispatchOutcome, SchedulerError> {
    let job = JobKind::DispatchNotifications;
    let params = json!({"minute_bucket": now.minute() / 15});
    run_job(repo, job.job_id(), &params, now, job.bucket_window(), || {
        let mut notified = 0usize;
        for user in candidate_users(repo).map_err(|e| e.to_string())? {
            let since = now - job.bucket_window();
            let insights = repo.insights_since(&user, since).map_err(|e| e.to_string())?;
            for insight in insights.iter().filter(|i| !i.suppressed) {
                if sink.notify(&user, &insight.title).is_ok() {
                    notified += 1;
                }
            }
        }
        Ok(format!("notified={notified}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn second_call_within_bucket_is_skipped() {
        let repo = MemoryStore::new();
        let now = at(2026, 1, 15, 9);
        let params = json!({});
        let first = run_job(&repo, "run_insights", &params, now, Duration::hours(1), || Ok("ok".to_string())).unwrap();
        let DispatchOutcome::Ran(first_run) = first else { panic!("expected Ran") };

        let second = run_job(&repo, "run_insights", &params, now + Duration::minutes(10), Duration::hours(1), || {
            panic!("work should not run twice")
        })
        .unwrap();
        match second {
            DispatchOutcome::Skipped { previous_run_id, .. } => assert_eq!(previous_run_id, first_run.id),
            DispatchOutcome::Ran(_) => panic!("expected second call to be skipped"),
        }
    }

    #[test]
    fn different_bucket_runs_again() {
        let repo = MemoryStore::new();
        let params = json!({});
        let first = run_job(&repo, "recompute_baselines", &params, at(2026, 1, 15, 2), Duration::days(1), || Ok("a".to_string())).unwrap();
        assert!(matches!(first, DispatchOutcome::Ran(_)));

        let second = run_job(&repo, "recompute_baselines", &params, at(2026, 1, 16, 2), Duration::days(1), || Ok("b".to_string())).unwrap();
        assert!(matches!(second, DispatchOutcome::Ran(_)));
    }

    #[test]
    fn failed_work_is_recorded_but_not_an_error() {
        let repo = MemoryStore::new();
        let params = json!({});
        let outcome = run_job(&repo, "sync_providers", &params, at(2026, 1, 15, 2), Duration::hours(6), || Err("boom".to_string())).unwrap();
        match outcome {
            DispatchOutcome::Ran(run) => {
                assert_eq!(run.status, JobStatus::Failed);
                assert_eq!(run.error.as_deref(), Some("boom"));
            }
            DispatchOutcome::Skipped { .. } => panic!("expected Ran"),
        }
    }

    #[test]
    fn job_kind_ids_match_spec_names() {
        assert_eq!(JobKind::RunInsights.job_id(), "run_insights");
        assert_eq!(JobKind::RecomputeBaselines.job_id(), "recompute_baselines");
        assert_eq!(JobKind::EvaluateDueExperiments.job_id(), "evaluate_due_experiments");
        assert_eq!(JobKind::SyncProviders.job_id(), "sync_providers");
        assert_eq!(JobKind::RecomputePersonalDrivers.job_id(), "recompute_personal_drivers");
        assert_eq!(JobKind::GenerateDailyNarrative.job_id(), "generate_daily_narrative");
        assert_eq!(JobKind::WeeklyTrustRollup.job_id(), "weekly_trust_rollup");
        assert_eq!(JobKind::DispatchNotifications.job_id(), "dispatch_notifications");
    }
}
