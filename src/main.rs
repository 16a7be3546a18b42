//! vitalloop-scheduler: the demo binary for the analytics core.
//!
//! There is no HTTP layer, OAuth flow, or UI in this crate (spec.md §1
//! Non-goals) — everything above the engine is assumed to be a separate
//! service. What a standalone run *can* show is the scheduler (C19)
//! actually driving a seeded user through one day of jobs: ingestion
//! already happened (seeded directly, since the ingestion HTTP endpoint
//! is out of scope), so this wires baselines, the insight loop,
//! attribution, evaluation, narrative synthesis, and the trust rollup
//! together and prints what each job produced.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;
use vitalloop_core::config::Config;
use vitalloop_core::crypto::{self, MasterKey};
use vitalloop_core::models::{
    AdherenceEvent, Consent, DailyCheckIn, DataProvenance, Experiment, ExperimentStatus, HealthDataPoint, PeriodType, ProviderToken,
};
use vitalloop_core::scheduler::{self, DispatchOutcome, NotificationSink, ProviderSyncer};
use vitalloop_core::store::sqlite::SqliteStore;
use vitalloop_core::store::{
    AdherenceRepository, CheckInRepository, ConsentRepository, ExperimentRepository, HealthDataRepository, NarrativeRepository,
    ProviderTokenRepository, TrustScoreRepository,
};
use vitalloop_core::trust;

const DEMO_USER: &str = "demo-user";

/// Provider sync is an external HTTP collaborator out of this crate's
/// scope (spec.md §1); the demo binary only needs something that
/// satisfies the trait so `dispatch_sync_providers` has somewhere to
/// delegate to.
struct NoopProviderSyncer;

impl ProviderSyncer for NoopProviderSyncer {
    fn sync(&self, user: &str, provider: &str) -> Result<usize, String> {
        log::info!("demo provider sync skipped user={user} provider={provider} (no adapter wired)");
        Ok(0)
    }
}

/// Same idea for the notification channel (spec.md §1 "no push/SMS/email
/// delivery"): the demo just logs what would have gone out.
struct LoggingNotificationSink;

impl NotificationSink for LoggingNotificationSink {
    fn notify(&self, user: &str, insight_title: &str) -> Result<(), String> {
        log::info!("notify user={user} insight={insight_title:?}");
        Ok(())
    }
}

fn log_outcome(job_id: &str, outcome: &DispatchOutcome) {
    match outcome {
        DispatchOutcome::Ran(run) => {
            log::info!(
                "job_ran job_id={job_id} status={:?} duration_ms={:?} summary={:?}",
                run.status,
                run.duration_ms,
                run.result_summary
            );
        }
        DispatchOutcome::Skipped { reason, previous_run_id } => {
            log::info!("job_skipped job_id={job_id} reason={reason} previous_run_id={previous_run_id}");
        }
    }
}

/// Seeds roughly six weeks of plausible data for one user: steady
/// sleep/HR/steps with a deliberate rise in sleep duration once the
/// intervention starts (so the detector pipeline and evaluation job have
/// something real to find), daily check-ins, and a magnesium glycinate
/// experiment with logged adherence.
fn seed_demo_user(repo: &SqliteStore, now: DateTime<Utc>) -> Result<(), Box<dyn std::error::Error>> {
    if !repo.all_users()?.is_empty() {
        log::info!("demo data already present, skipping seed");
        return Ok(());
    }

    let provenance_id = Uuid::new_v4();
    let consent = Consent {
        user: DEMO_USER.to_string(),
        version: "v1".to_string(),
        data_analysis: true,
        experimental_recommendations: true,
        stop_anytime: true,
        provider_ingestion: [("whoop".to_string(), true)].into_iter().collect(),
        revoked_at: None,
        recorded_at: now - ChronoDuration::days(45),
    };
    repo.upsert_consent(&consent)?;

    let master = MasterKey::generate();
    let access = crypto::encrypt_provider_token(&master, "demo-access-token")?;
    repo.upsert_provider_token(&ProviderToken {
        user: DEMO_USER.to_string(),
        provider: "whoop".to_string(),
        access_token_encrypted: access.to_hex(),
        refresh_token_encrypted: None,
        token_type: Some("bearer".to_string()),
        scope: Some("recovery sleep".to_string()),
        expires_at: Some(now + ChronoDuration::days(30)),
    })?;

    let experiment = Experiment {
        id: Uuid::new_v4(),
        user: DEMO_USER.to_string(),
        intervention: "magnesium_glycinate".to_string(),
        primary_metric: "sleep_duration".to_string(),
        expected_direction: Some(vitalloop_core::models::Direction::Positive),
        started_at: now - ChronoDuration::days(14),
        ended_at: None,
        status: ExperimentStatus::Active,
        baseline_window_days: 14,
        intervention_window_days: 14,
    };
    repo.upsert_experiment(&experiment)?;

    let mut points = Vec::new();
    for day in 0..45i64 {
        let ts = now - ChronoDuration::days(44 - day);

        // Sleep duration rises by ~35 minutes once the intervention
        // starts (day 31 onward, mirroring `experiment.started_at`), so
        // the evaluation job has a real effect to compare against
        // baseline.
        let post_intervention = day >= 31;
        let sleep_minutes = if post_intervention { 455.0 } else { 420.0 } + ((day % 5) as f64 - 2.0) * 6.0;
        let resting_hr = 58.0 + ((day % 7) as f64 - 3.0) * 0.8;
        let hrv = 62.0 + ((day % 6) as f64 - 2.5) * 1.5;
        let steps = 8200.0 + ((day % 4) as f64 - 1.5) * 400.0;

        for (metric_key, value, unit) in [
            ("sleep_duration", sleep_minutes, "minutes"),
            ("resting_hr", resting_hr, "bpm"),
            ("hrv_rmssd", hrv, "ms"),
            ("steps", steps, "count"),
        ] {
            points.push(HealthDataPoint {
                id: Uuid::new_v4(),
                user: DEMO_USER.to_string(),
                metric_key: metric_key.to_string(),
                value,
                unit: unit.to_string(),
                timestamp: ts,
                source: "whoop".to_string(),
                provenance_id,
                quality_score: 0.95,
                flagged: false,
            });
        }

        let mut behaviors = BTreeMap::new();
        behaviors.insert("caffeine_mg".to_string(), if day % 3 == 0 { 150.0 } else { 80.0 });
        behaviors.insert("exercise_minutes".to_string(), if day % 2 == 0 { 30.0 } else { 0.0 });
        repo.upsert_checkin(&DailyCheckIn {
            user: DEMO_USER.to_string(),
            date: ts.date_naive(),
            behaviors,
            symptom_tags: Vec::new(),
            notes_present: false,
        })?;

        if post_intervention {
            repo.insert_adherence(&AdherenceEvent {
                id: Uuid::new_v4(),
                user: DEMO_USER.to_string(),
                experiment: experiment.id,
                timestamp: ts,
                taken: day % 7 != 6, // one missed dose a week
                dose: Some("200mg".to_string()),
            })?;
        }
    }
    repo.insert_points(&points)?;
    repo.insert_provenance(&DataProvenance {
        id: Uuid::new_v4(),
        user: DEMO_USER.to_string(),
        source_type: "provider".to_string(),
        source_name: "whoop".to_string(),
        source_record_id: None,
        ingestion_run_id: provenance_id,
        received_at: now,
        quality_score: 0.95,
        validation_errors: Vec::new(),
    })?;

    log::info!("seeded {} points across 45 days for {DEMO_USER}", points.len());
    Ok(())
}

/// One full pass through every scheduled job, in the dependency order
/// each job expects its inputs to already exist in (baselines before the
/// insight loop reads them, drivers before the narrative quotes them).
fn run_all_jobs(repo: &SqliteStore, config: &Config, now: DateTime<Utc>) -> Result<(), Box<dyn std::error::Error>> {
    log_outcome("sync_providers", &scheduler::dispatch_sync_providers(repo, &NoopProviderSyncer, now)?);
    log_outcome("recompute_baselines", &scheduler::dispatch_recompute_baselines(repo, config, now)?);
    log_outcome("run_insights", &scheduler::dispatch_run_insights(repo, config, now)?);
    log_outcome("evaluate_due_experiments", &scheduler::dispatch_evaluate_due_experiments(repo, now)?);
    log_outcome("recompute_personal_drivers", &scheduler::dispatch_recompute_personal_drivers(repo, now)?);
    log_outcome("generate_daily_narrative", &scheduler::dispatch_generate_daily_narrative(repo, now)?);
    log_outcome("weekly_trust_rollup", &scheduler::dispatch_weekly_trust_rollup(repo, now)?);
    log_outcome("dispatch_notifications", &scheduler::dispatch_notifications(repo, &LoggingNotificationSink, now)?);
    Ok(())
}

/// The scheduler's worker loop lives on a `tokio` interval so a real
/// deployment can run this binary as a long-lived process; each tick is
/// still a synchronous pass since every job below is CPU-bound, not I/O
/// bound (spec.md §5 puts the async boundary here, not inside the jobs).
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_env();
    log::info!("vitalloop-scheduler starting env_mode={:?} database_url={}", config.env_mode, config.database_url);

    let repo = SqliteStore::open(&config.database_url)?;
    let now = Utc::now();

    seed_demo_user(&repo, now)?;
    run_all_jobs(&repo, &config, now)?;

    let period_end = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
    let period_start = period_end - ChronoDuration::days(1);
    if let Some(narrative) = repo.get_narrative(&DEMO_USER.to_string(), PeriodType::Daily, period_start, period_end)? {
        println!("\n{}\n{}\n", narrative.title, narrative.summary);
        for point in &narrative.key_points {
            println!("  - {}", point.text);
        }
    }
    if let Some(score) = repo.get_trust_score(&DEMO_USER.to_string())? {
        println!("\ntrust score: {:.1} ({})", score.overall, trust::trust_level(&score));
    }

    let run_loop_forever = std::env::var("VITALLOOP_LOOP").map(|v| v == "1").unwrap_or(false);
    if run_loop_forever {
        log::info!("entering scheduler loop, tick every 60s (jobs self-dedupe via their bucket windows)");
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let tick_now = Utc::now();
            if let Err(e) = run_all_jobs(&repo, &config, tick_now) {
                log::error!("scheduler tick failed: {e}");
            }
        }
    }

    Ok(())
}
