//! Persistence layer.
//!
//! The teacher persists through `rusqlite` with hand-written SQL behind a
//! single `Vault` struct (`vault.rs`). We generalize that shape into one
//! `Repository` trait per aggregate (spec.md §6 "Persisted state layout")
//! so the engine modules in the rest of this crate never see a `Connection`
//! directly — they're handed plain data and hand back plain data, and
//! whatever implements these traits is the only thing that touches SQL.
//!
//! Two implementations are provided: [`sqlite`] for real persistence and
//! [`memory`] for tests, so the test suite never depends on a filesystem
//! database (spec.md §6 "Test tooling").

pub mod memory;
pub mod sqlite;

use crate::models::{
    AdherenceEvent, AuditEvent, Baseline, CausalMemory, Consent, DailyCheckIn, DataProvenance, EvaluationResult, ExperimentStatus,
    ExplanationEdge, HealthDataPoint, Insight, Intervention, JobRun, Narrative, PeriodType, PersonalDriver, ProviderToken, TrustScore,
    UserId,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub trait ConsentRepository: Send + Sync {
    fn latest_consent(&self, user: &UserId) -> Result<Option<Consent>, StoreError>;
    fn upsert_consent(&self, consent: &Consent) -> Result<(), StoreError>;
    /// Every user with a consent record on file — the enumerable universe
    /// the scheduler (C19) iterates for per-user jobs, since a user with no
    /// consent record can never pass the Consent Gate (C18) anyway.
    fn all_users(&self) -> Result<Vec<UserId>, StoreError>;
}

pub trait HealthDataRepository: Send + Sync {
    fn insert_points(&self, points: &[HealthDataPoint]) -> Result<(), StoreError>;
    fn insert_provenance(&self, provenance: &DataProvenance) -> Result<(), StoreError>;
    /// Points for (user, metric_key) with `timestamp` in `[since, until]`, oldest first.
    fn points_in_window(
        &self,
        user: &UserId,
        metric_key: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<HealthDataPoint>, StoreError>;
    fn latest_point(&self, user: &UserId, metric_key: &str) -> Result<Option<HealthDataPoint>, StoreError>;
    fn all_points_for_user(&self, user: &UserId) -> Result<Vec<HealthDataPoint>, StoreError>;
}

pub trait CheckInRepository: Send + Sync {
    fn upsert_checkin(&self, checkin: &DailyCheckIn) -> Result<(), StoreError>;
    fn checkins_in_window(&self, user: &UserId, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<DailyCheckIn>, StoreError>;
}

pub trait BaselineRepository: Send + Sync {
    fn get_baseline(&self, user: &UserId, metric_key: &str) -> Result<Option<Baseline>, StoreError>;
    fn upsert_baseline(&self, baseline: &Baseline) -> Result<(), StoreError>;
}

pub trait InsightRepository: Send + Sync {
    fn insert_insights(&self, insights: &[Insight]) -> Result<(), StoreError>;
    fn insights_since(&self, user: &UserId, since: DateTime<Utc>) -> Result<Vec<Insight>, StoreError>;
    /// Count of non-suppressed insights generated for `user` on the UTC
    /// calendar day of `day`, used by the daily cap (C12).
    fn surfaced_count_on(&self, user: &UserId, day: DateTime<Utc>) -> Result<usize, StoreError>;
}

pub trait InterventionRepository: Send + Sync {
    fn get_intervention(&self, user: &UserId, key: &str) -> Result<Option<Intervention>, StoreError>;
    fn upsert_intervention(&self, intervention: &Intervention) -> Result<(), StoreError>;
}

pub trait ExperimentRepository: Send + Sync {
    fn get_experiment(&self, id: uuid::Uuid) -> Result<Option<crate::models::Experiment>, StoreError>;
    fn upsert_experiment(&self, experiment: &crate::models::Experiment) -> Result<(), StoreError>;
    fn experiments_with_status(&self, user: &UserId, status: ExperimentStatus) -> Result<Vec<crate::models::Experiment>, StoreError>;
    fn all_active_experiments(&self) -> Result<Vec<crate::models::Experiment>, StoreError>;
}

pub trait AdherenceRepository: Send + Sync {
    fn insert_adherence(&self, event: &AdherenceEvent) -> Result<(), StoreError>;
    fn adherence_for_experiment(&self, experiment: uuid::Uuid) -> Result<Vec<AdherenceEvent>, StoreError>;
}

pub trait EvaluationRepository: Send + Sync {
    fn insert_evaluation(&self, evaluation: &EvaluationResult) -> Result<(), StoreError>;
    fn evaluations_for_user(&self, user: &UserId) -> Result<Vec<EvaluationResult>, StoreError>;
}

pub trait DriverRepository: Send + Sync {
    /// Replaces the full set of personal drivers for `user` (C13 findings
    /// are recomputed wholesale, never patched in place — spec.md §3
    /// "Created by attribution engine; replaced on recompute").
    fn replace_drivers(&self, user: &UserId, drivers: &[PersonalDriver]) -> Result<(), StoreError>;
    fn drivers_for_user(&self, user: &UserId) -> Result<Vec<PersonalDriver>, StoreError>;
}

pub trait CausalMemoryRepository: Send + Sync {
    fn get_causal_memory(&self, user: &UserId, driver_key: &str, metric_key: &str) -> Result<Option<CausalMemory>, StoreError>;
    fn upsert_causal_memory(&self, memory: &CausalMemory) -> Result<(), StoreError>;
    fn causal_memories_for_user(&self, user: &UserId) -> Result<Vec<CausalMemory>, StoreError>;
}

pub trait NarrativeRepository: Send + Sync {
    /// Upsert keyed by (user, period_type, period_start, period_end).
    fn upsert_narrative(&self, narrative: &Narrative) -> Result<(), StoreError>;
    fn get_narrative(
        &self,
        user: &UserId,
        period_type: PeriodType,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<Narrative>, StoreError>;
}

pub trait TrustScoreRepository: Send + Sync {
    fn upsert_trust_score(&self, score: &TrustScore) -> Result<(), StoreError>;
    fn get_trust_score(&self, user: &UserId) -> Result<Option<TrustScore>, StoreError>;
}

pub trait JobRunRepository: Send + Sync {
    fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<JobRun>, StoreError>;
    fn insert_job_run(&self, run: &JobRun) -> Result<(), StoreError>;
    fn update_job_run(&self, run: &JobRun) -> Result<(), StoreError>;
}

pub trait AuditRepository: Send + Sync {
    fn append_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError>;
    fn append_explanation_edge(&self, edge: &ExplanationEdge) -> Result<(), StoreError>;
    fn audit_events_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEvent>, StoreError>;
    /// Hash of the most recently appended audit event, the chain's tip
    /// (`crypto::hash_chain_entry`'s `previous_hash` input for the next one).
    fn latest_audit_hash(&self) -> Result<Option<String>, StoreError>;
}

pub trait ProviderTokenRepository: Send + Sync {
    fn get_provider_token(&self, user: &UserId, provider: &str) -> Result<Option<ProviderToken>, StoreError>;
    fn upsert_provider_token(&self, token: &ProviderToken) -> Result<(), StoreError>;
    fn delete_provider_token(&self, user: &UserId, provider: &str) -> Result<(), StoreError>;
}

/// The full repository surface the loop runner and scheduler are written
/// against. Both [`sqlite::SqliteStore`] and [`memory::MemoryStore`]
/// implement it; nothing outside this module ever names a concrete type.
pub trait Repository:
    ConsentRepository
    + HealthDataRepository
    + CheckInRepository
    + BaselineRepository
    + InsightRepository
    + InterventionRepository
    + ExperimentRepository
    + AdherenceRepository
    + EvaluationRepository
    + DriverRepository
    + CausalMemoryRepository
    + NarrativeRepository
    + TrustScoreRepository
    + JobRunRepository
    + AuditRepository
    + ProviderTokenRepository
{
}

impl<T> Repository for T where
    T: ConsentRepository
        + HealthDataRepository
        + CheckInRepository
        + BaselineRepository
        + InsightRepository
        + InterventionRepository
        + ExperimentRepository
        + AdherenceRepository
        + EvaluationRepository
        + DriverRepository
        + CausalMemoryRepository
        + NarrativeRepository
        + TrustScoreRepository
        + JobRunRepository
        + AuditRepository
        + ProviderTokenRepository
{
}
