//! In-memory repository implementation, used by the test suite so tests
//! never touch a filesystem database. Grounded on the same trait split as
//! [`super::sqlite`]; `HashMap`s guarded by `RwLock` stand in for tables.

use super::{
    AdherenceRepository, AuditRepository, BaselineRepository, CausalMemoryRepository, CheckInRepository, ConsentRepository,
    DriverRepository, EvaluationRepository, ExperimentRepository, HealthDataRepository, InsightRepository, InterventionRepository,
    JobRunRepository, NarrativeRepository, ProviderTokenRepository, StoreError, TrustScoreRepository,
};
use crate::models::{
    AdherenceEvent, AuditEvent, Baseline, CausalMemory, Consent, DailyCheckIn, DataProvenance, EvaluationResult, Experiment,
    ExperimentStatus, ExplanationEdge, HealthDataPoint, Insight, Intervention, JobRun, Narrative, PeriodType, PersonalDriver,
    ProviderToken, TrustScore, UserId,
};
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    consent: RwLock<HashMap<UserId, Consent>>,
    points: RwLock<Vec<HealthDataPoint>>,
    provenance: RwLock<Vec<DataProvenance>>,
    checkins: RwLock<HashMap<(UserId, chrono::NaiveDate), DailyCheckIn>>,
    baselines: RwLock<HashMap<(UserId, String), Baseline>>,
    insights: RwLock<Vec<Insight>>,
    interventions: RwLock<HashMap<(UserId, String), Intervention>>,
    experiments: RwLock<HashMap<Uuid, Experiment>>,
    adherence: RwLock<Vec<AdherenceEvent>>,
    evaluations: RwLock<Vec<EvaluationResult>>,
    drivers: RwLock<HashMap<UserId, Vec<PersonalDriver>>>,
    causal_memory: RwLock<HashMap<(UserId, String, String), CausalMemory>>,
    narratives: RwLock<HashMap<(UserId, PeriodType, DateTime<Utc>, DateTime<Utc>), Narrative>>,
    trust_scores: RwLock<HashMap<UserId, TrustScore>>,
    job_runs: RwLock<HashMap<String, JobRun>>,
    audit_events: RwLock<Vec<AuditEvent>>,
    explanation_edges: RwLock<Vec<ExplanationEdge>>,
    provider_tokens: RwLock<HashMap<(UserId, String), ProviderToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsentRepository for MemoryStore {
    fn latest_consent(&self, user: &UserId) -> Result<Option<Consent>, StoreError> {
        Ok(self.consent.read().unwrap().get(user).cloned())
    }

    fn upsert_consent(&self, consent: &Consent) -> Result<(), StoreError> {
        self.consent.write().unwrap().insert(consent.user.clone(), consent.clone());
        Ok(())
    }

    fn all_users(&self) -> Result<Vec<UserId>, StoreError> {
        let mut users: Vec<UserId> = self.consent.read().unwrap().keys().cloned().collect();
        users.sort();
        Ok(users)
    }
}

impl HealthDataRepository for MemoryStore {
    fn insert_points(&self, points: &[HealthDataPoint]) -> Result<(), StoreError> {
        self.points.write().unwrap().extend(points.iter().cloned());
        Ok(())
    }

    fn insert_provenance(&self, provenance: &DataProvenance) -> Result<(), StoreError> {
        self.provenance.write().unwrap().push(provenance.clone());
        Ok(())
    }

    fn points_in_window(
        &self,
        user: &UserId,
        metric_key: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<HealthDataPoint>, StoreError> {
        let mut result: Vec<HealthDataPoint> = self
            .points
            .read()
            .unwrap()
            .iter()
            .filter(|p| &p.user == user && p.metric_key == metric_key && p.timestamp >= since && p.timestamp <= until)
            .cloned()
            .collect();
        result.sort_by_key(|p| p.timestamp);
        Ok(result)
    }

    fn latest_point(&self, user: &UserId, metric_key: &str) -> Result<Option<HealthDataPoint>, StoreError> {
        Ok(self
            .points
            .read()
            .unwrap()
            .iter()
            .filter(|p| &p.user == user && p.metric_key == metric_key)
            .max_by_key(|p| p.timestamp)
            .cloned())
    }

    fn all_points_for_user(&self, user: &UserId) -> Result<Vec<HealthDataPoint>, StoreError> {
        Ok(self.points.read().unwrap().iter().filter(|p| &p.user == user).cloned().collect())
    }
}

impl CheckInRepository for MemoryStore {
    fn upsert_checkin(&self, checkin: &DailyCheckIn) -> Result<(), StoreError> {
        self.checkins.write().unwrap().insert((checkin.user.clone(), checkin.date), checkin.clone());
        Ok(())
    }

    fn checkins_in_window(&self, user: &UserId, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<DailyCheckIn>, StoreError> {
        let mut result: Vec<DailyCheckIn> = self
            .checkins
            .read()
            .unwrap()
            .values()
            .filter(|c| {
                &c.user == user
                    && c.date >= since.date_naive()
                    && c.date <= until.date_naive()
            })
            .cloned()
            .collect();
        result.sort_by_key(|c| c.date);
        Ok(result)
    }
}

impl BaselineRepository for MemoryStore {
    fn get_baseline(&self, user: &UserId, metric_key: &str) -> Result<Option<Baseline>, StoreError> {
        Ok(self.baselines.read().unwrap().get(&(user.clone(), metric_key.to_string())).cloned())
    }

    fn upsert_baseline(&self, baseline: &Baseline) -> Result<(), StoreError> {
        self.baselines.write().unwrap().insert((baseline.user.clone(), baseline.metric_key.clone()), baseline.clone());
        Ok(())
    }
}

impl InsightRepository for MemoryStore {
    fn insert_insights(&self, insights: &[Insight]) -> Result<(), StoreError> {
        self.insights.write().unwrap().extend(insights.iter().cloned());
        Ok(())
    }

    fn insights_since(&self, user: &UserId, since: DateTime<Utc>) -> Result<Vec<Insight>, StoreError> {
        Ok(self.insights.read().unwrap().iter().filter(|i| &i.user == user && i.generated_at >= since).cloned().collect())
    }

    fn surfaced_count_on(&self, user: &UserId, day: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(self
            .insights
            .read()
            .unwrap()
            .iter()
            .filter(|i| &i.user == user && !i.suppressed && i.generated_at.num_days_from_ce() == day.num_days_from_ce())
            .count())
    }
}

impl InterventionRepository for MemoryStore {
    fn get_intervention(&self, user: &UserId, key: &str) -> Result<Option<Intervention>, StoreError> {
        Ok(self.interventions.read().unwrap().get(&(user.clone(), key.to_string())).cloned())
    }

    fn upsert_intervention(&self, intervention: &Intervention) -> Result<(), StoreError> {
        self.interventions.write().unwrap().insert((intervention.user.clone(), intervention.key.clone()), intervention.clone());
        Ok(())
    }
}

impl ExperimentRepository for MemoryStore {
    fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError> {
        Ok(self.experiments.read().unwrap().get(&id).cloned())
    }

    fn upsert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        self.experiments.write().unwrap().insert(experiment.id, experiment.clone());
        Ok(())
    }

    fn experiments_with_status(&self, user: &UserId, status: ExperimentStatus) -> Result<Vec<Experiment>, StoreError> {
        Ok(self.experiments.read().unwrap().values().filter(|e| &e.user == user && e.status == status).cloned().collect())
    }

    fn all_active_experiments(&self) -> Result<Vec<Experiment>, StoreError> {
        Ok(self.experiments.read().unwrap().values().filter(|e| e.status == ExperimentStatus::Active).cloned().collect())
    }
}

impl AdherenceRepository for MemoryStore {
    fn insert_adherence(&self, event: &AdherenceEvent) -> Result<(), StoreError> {
        self.adherence.write().unwrap().push(event.clone());
        Ok(())
    }

    fn adherence_for_experiment(&self, experiment: Uuid) -> Result<Vec<AdherenceEvent>, StoreError> {
        Ok(self.adherence.read().unwrap().iter().filter(|e| e.experiment == experiment).cloned().collect())
    }
}

impl EvaluationRepository for MemoryStore {
    fn insert_evaluation(&self, evaluation: &EvaluationResult) -> Result<(), StoreError> {
        self.evaluations.write().unwrap().push(evaluation.clone());
        Ok(())
    }

    fn evaluations_for_user(&self, user: &UserId) -> Result<Vec<EvaluationResult>, StoreError> {
        Ok(self.evaluations.read().unwrap().iter().filter(|e| &e.user == user).cloned().collect())
    }
}

impl DriverRepository for MemoryStore {
    fn replace_drivers(&self, user: &UserId, drivers: &[PersonalDriver]) -> Result<(), StoreError> {
        self.drivers.write().unwrap().insert(user.clone(), drivers.to_vec());
        Ok(())
    }

    fn drivers_for_user(&self, user: &UserId) -> Result<Vec<PersonalDriver>, StoreError> {
        Ok(self.drivers.read().unwrap().get(user).cloned().unwrap_or_default())
    }
}

impl CausalMemoryRepository for MemoryStore {
    fn get_causal_memory(&self, user: &UserId, driver_key: &str, metric_key: &str) -> Result<Option<CausalMemory>, StoreError> {
        Ok(self.causal_memory.read().unwrap().get(&(user.clone(), driver_key.to_string(), metric_key.to_string())).cloned())
    }

    fn upsert_causal_memory(&self, memory: &CausalMemory) -> Result<(), StoreError> {
        self.causal_memory
            .write()
            .unwrap()
            .insert((memory.user.clone(), memory.driver_key.clone(), memory.metric_key.clone()), memory.clone());
        Ok(())
    }

    fn causal_memories_for_user(&self, user: &UserId) -> Result<Vec<CausalMemory>, StoreError> {
        Ok(self.causal_memory.read().unwrap().values().filter(|m| &m.user == user).cloned().collect())
    }
}

impl NarrativeRepository for MemoryStore {
    fn upsert_narrative(&self, narrative: &Narrative) -> Result<(), StoreError> {
        self.narratives.write().unwrap().insert(
            (narrative.user.clone(), narrative.period_type, narrative.period_start, narrative.period_end),
            narrative.clone(),
        );
        Ok(())
    }

    fn get_narrative(
        &self,
        user: &UserId,
        period_type: PeriodType,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<Narrative>, StoreError> {
        Ok(self.narratives.read().unwrap().get(&(user.clone(), period_type, period_start, period_end)).cloned())
    }
}

impl TrustScoreRepository for MemoryStore {
    fn upsert_trust_score(&self, score: &TrustScore) -> Result<(), StoreError> {
        self.trust_scores.write().unwrap().insert(score.user.clone(), score.clone());
        Ok(())
    }

    fn get_trust_score(&self, user: &UserId) -> Result<Option<TrustScore>, StoreError> {
        Ok(self.trust_scores.read().unwrap().get(user).cloned())
    }
}

impl JobRunRepository for MemoryStore {
    fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<JobRun>, StoreError> {
        Ok(self.job_runs.read().unwrap().get(idempotency_key).cloned())
    }

    fn insert_job_run(&self, run: &JobRun) -> Result<(), StoreError> {
        self.job_runs.write().unwrap().insert(run.idempotency_key.clone(), run.clone());
        Ok(())
    }

    fn update_job_run(&self, run: &JobRun) -> Result<(), StoreError> {
        self.job_runs.write().unwrap().insert(run.idempotency_key.clone(), run.clone());
        Ok(())
    }
}

impl AuditRepository for MemoryStore {
    fn append_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.audit_events.write().unwrap().push(event.clone());
        Ok(())
    }

    fn append_explanation_edge(&self, edge: &ExplanationEdge) -> Result<(), StoreError> {
        self.explanation_edges.write().unwrap().push(edge.clone());
        Ok(())
    }

    fn audit_events_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self
            .audit_events
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    fn latest_audit_hash(&self) -> Result<Option<String>, StoreError> {
        Ok(self.audit_events.read().unwrap().last().map(|e| crate::crypto::hash_sha256(e.id.as_bytes())))
    }
}

impl ProviderTokenRepository for MemoryStore {
    fn get_provider_token(&self, user: &UserId, provider: &str) -> Result<Option<ProviderToken>, StoreError> {
        Ok(self.provider_tokens.read().unwrap().get(&(user.clone(), provider.to_string())).cloned())
    }

    fn upsert_provider_token(&self, token: &ProviderToken) -> Result<(), StoreError> {
        self.provider_tokens.write().unwrap().insert((token.user.clone(), token.provider.clone()), token.clone());
        Ok(())
    }

    fn delete_provider_token(&self, user: &UserId, provider: &str) -> Result<(), StoreError> {
        self.provider_tokens.write().unwrap().remove(&(user.clone(), provider.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn consent_upsert_then_read_round_trips() {
        let store = MemoryStore::new();
        let consent = Consent {
            user: "u1".to_string(),
            version: "v1".to_string(),
            data_analysis: true,
            experimental_recommendations: false,
            stop_anytime: true,
            provider_ingestion: Default::default(),
            revoked_at: None,
            recorded_at: Utc::now(),
        };
        store.upsert_consent(&consent).unwrap();
        let fetched = store.latest_consent(&"u1".to_string()).unwrap().unwrap();
        assert!(fetched.data_analysis);
    }

    #[test]
    fn points_in_window_filters_by_user_metric_and_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let point = HealthDataPoint {
            id: Uuid::new_v4(),
            user: "u1".to_string(),
            metric_key: "sleep_duration".to_string(),
            value: 420.0,
            unit: "minutes".to_string(),
            timestamp: now,
            source: "oura".to_string(),
            provenance_id: Uuid::new_v4(),
            quality_score: 1.0,
            flagged: false,
        };
        store.insert_points(&[point.clone()]).unwrap();
        let found = store.points_in_window(&"u1".to_string(), "sleep_duration", now - chrono::Duration::days(1), now).unwrap();
        assert_eq!(found.len(), 1);
        let not_found = store.points_in_window(&"u2".to_string(), "sleep_duration", now - chrono::Duration::days(1), now).unwrap();
        assert!(not_found.is_empty());
    }

    #[test]
    fn job_run_idempotency_lookup_finds_existing_run() {
        let store = MemoryStore::new();
        let run = JobRun {
            id: Uuid::new_v4(),
            job_id: "run_insights".to_string(),
            idempotency_key: "key-1".to_string(),
            status: crate::models::JobStatus::Completed,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result_summary: None,
            error: None,
        };
        store.insert_job_run(&run).unwrap();
        assert!(store.find_by_idempotency_key("key-1").unwrap().is_some());
        assert!(store.find_by_idempotency_key("key-2").unwrap().is_none());
    }
}
