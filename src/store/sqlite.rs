//! `rusqlite`-backed repository implementation.
//!
//! One connection guarded by `std::sync::Mutex`, generalizing the
//! teacher's `AppState { vault: Mutex<Vault> }` pattern (`vault.rs`).
//! Schema is created with embedded `CREATE TABLE IF NOT EXISTS`
//! statements in the teacher's style; no ORM. Aggregates with few,
//! frequently-filtered fields get real columns; the rest of each struct
//! rides along as a JSON blob column, the same trick the teacher uses for
//! `notes.detection_ids` and `notes.attestations`.

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
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = SqliteStore { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS consent (
                user TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS health_data_points (
                id TEXT PRIMARY KEY,
                user TEXT NOT NULL,
                metric_key TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_points_user_metric_time
                ON health_data_points(user, metric_key, timestamp);

            CREATE TABLE IF NOT EXISTS data_provenance (
                id TEXT PRIMARY KEY,
                user TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_checkins (
                user TEXT NOT NULL,
                date TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (user, date)
            );

            CREATE TABLE IF NOT EXISTS baselines (
                user TEXT NOT NULL,
                metric_key TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (user, metric_key)
            );

            CREATE TABLE IF NOT EXISTS insights (
                id TEXT PRIMARY KEY,
                user TEXT NOT NULL,
                generated_at TEXT NOT NULL,
                suppressed INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_insights_user_time ON insights(user, generated_at);

            CREATE TABLE IF NOT EXISTS interventions (
                user TEXT NOT NULL,
                key TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (user, key)
            );

            CREATE TABLE IF NOT EXISTS experiments (
                id TEXT PRIMARY KEY,
                user TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_experiments_user_status ON experiments(user, status);

            CREATE TABLE IF NOT EXISTS adherence_events (
                id TEXT PRIMARY KEY,
                experiment TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_adherence_experiment ON adherence_events(experiment);

            CREATE TABLE IF NOT EXISTS evaluation_results (
                id TEXT PRIMARY KEY,
                user TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS personal_drivers (
                user TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS causal_memory (
                user TEXT NOT NULL,
                driver_key TEXT NOT NULL,
                metric_key TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (user, driver_key, metric_key)
            );

            CREATE TABLE IF NOT EXISTS narratives (
                user TEXT NOT NULL,
                period_type TEXT NOT NULL,
                period_start TEXT NOT NULL,
                period_end TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (user, period_type, period_start, period_end)
            );

            CREATE TABLE IF NOT EXISTS trust_scores (
                user TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_runs (
                idempotency_key TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_events (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_events(entity_type, entity_id);

            CREATE TABLE IF NOT EXISTS explanation_edges (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS provider_tokens (
                user TEXT NOT NULL,
                provider TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (user, provider)
            );
            "#,
        )?;
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

impl ConsentRepository for SqliteStore {
    fn latest_consent(&self, user: &UserId) -> Result<Option<Consent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> =
            conn.query_row("SELECT data FROM consent WHERE user = ?1", params![user], |r| r.get(0)).optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    fn upsert_consent(&self, consent: &Consent) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO consent (user, data) VALUES (?1, ?2)
             ON CONFLICT(user) DO UPDATE SET data = excluded.data",
            params![consent.user, to_json(consent)?],
        )?;
        Ok(())
    }

    fn all_users(&self) -> Result<Vec<UserId>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT user FROM consent ORDER BY user")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<Result<Vec<UserId>, rusqlite::Error>>().map_err(StoreError::from)
    }
}

impl HealthDataRepository for SqliteStore {
    fn insert_points(&self, points: &[HealthDataPoint]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for point in points {
            tx.execute(
                "INSERT INTO health_data_points (id, user, metric_key, timestamp, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![point.id.to_string(), point.user, point.metric_key, point.timestamp.to_rfc3339(), to_json(point)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_provenance(&self, provenance: &DataProvenance) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO data_provenance (id, user, data) VALUES (?1, ?2, ?3)",
            params![provenance.id.to_string(), provenance.user, to_json(provenance)?],
        )?;
        Ok(())
    }

    fn points_in_window(
        &self,
        user: &UserId,
        metric_key: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<HealthDataPoint>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT data FROM health_data_points
             WHERE user = ?1 AND metric_key = ?2 AND timestamp >= ?3 AND timestamp <= ?4
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![user, metric_key, since.to_rfc3339(), until.to_rfc3339()], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }

    fn latest_point(&self, user: &UserId, metric_key: &str) -> Result<Option<HealthDataPoint>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM health_data_points WHERE user = ?1 AND metric_key = ?2 ORDER BY timestamp DESC LIMIT 1",
                params![user, metric_key],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    fn all_points_for_user(&self, user: &UserId) -> Result<Vec<HealthDataPoint>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM health_data_points WHERE user = ?1 ORDER BY timestamp ASC")?;
        let rows = stmt.query_map(params![user], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }
}

impl CheckInRepository for SqliteStore {
    fn upsert_checkin(&self, checkin: &DailyCheckIn) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO daily_checkins (user, date, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(user, date) DO UPDATE SET data = excluded.data",
            params![checkin.user, checkin.date.to_string(), to_json(checkin)?],
        )?;
        Ok(())
    }

    fn checkins_in_window(&self, user: &UserId, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<DailyCheckIn>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM daily_checkins WHERE user = ?1 AND date >= ?2 AND date <= ?3 ORDER BY date ASC")?;
        let rows = stmt.query_map(params![user, since.date_naive().to_string(), until.date_naive().to_string()], |r| {
            r.get::<_, String>(0)
        })?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }
}

impl BaselineRepository for SqliteStore {
    fn get_baseline(&self, user: &UserId, metric_key: &str) -> Result<Option<Baseline>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT data FROM baselines WHERE user = ?1 AND metric_key = ?2", params![user, metric_key], |r| r.get(0))
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    fn upsert_baseline(&self, baseline: &Baseline) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO baselines (user, metric_key, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(user, metric_key) DO UPDATE SET data = excluded.data",
            params![baseline.user, baseline.metric_key, to_json(baseline)?],
        )?;
        Ok(())
    }
}

impl InsightRepository for SqliteStore {
    fn insert_insights(&self, insights: &[Insight]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for insight in insights {
            tx.execute(
                "INSERT INTO insights (id, user, generated_at, suppressed, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![insight.id.to_string(), insight.user, insight.generated_at.to_rfc3339(), insight.suppressed, to_json(insight)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insights_since(&self, user: &UserId, since: DateTime<Utc>) -> Result<Vec<Insight>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM insights WHERE user = ?1 AND generated_at >= ?2 ORDER BY generated_at ASC")?;
        let rows = stmt.query_map(params![user, since.to_rfc3339()], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }

    fn surfaced_count_on(&self, user: &UserId, day: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let start = day.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        let end = day.date_naive().and_hms_opt(23, 59, 59).unwrap().and_utc();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM insights WHERE user = ?1 AND suppressed = 0 AND generated_at >= ?2 AND generated_at <= ?3",
            params![user, start.to_rfc3339(), end.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }
}

impl InterventionRepository for SqliteStore {
    fn get_intervention(&self, user: &UserId, key: &str) -> Result<Option<Intervention>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> =
            conn.query_row("SELECT data FROM interventions WHERE user = ?1 AND key = ?2", params![user, key], |r| r.get(0)).optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    fn upsert_intervention(&self, intervention: &Intervention) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO interventions (user, key, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(user, key) DO UPDATE SET data = excluded.data",
            params![intervention.user, intervention.key, to_json(intervention)?],
        )?;
        Ok(())
    }
}

impl ExperimentRepository for SqliteStore {
    fn get_experiment(&self, id: Uuid) -> Result<Option<Experiment>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> =
            conn.query_row("SELECT data FROM experiments WHERE id = ?1", params![id.to_string()], |r| r.get(0)).optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    fn upsert_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let status = format!("{:?}", experiment.status);
        conn.execute(
            "INSERT INTO experiments (id, user, status, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data",
            params![experiment.id.to_string(), experiment.user, status, to_json(experiment)?],
        )?;
        Ok(())
    }

    fn experiments_with_status(&self, user: &UserId, status: ExperimentStatus) -> Result<Vec<Experiment>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let status_str = format!("{:?}", status);
        let mut stmt = conn.prepare("SELECT data FROM experiments WHERE user = ?1 AND status = ?2")?;
        let rows = stmt.query_map(params![user, status_str], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }

    fn all_active_experiments(&self) -> Result<Vec<Experiment>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let status_str = format!("{:?}", ExperimentStatus::Active);
        let mut stmt = conn.prepare("SELECT data FROM experiments WHERE status = ?1")?;
        let rows = stmt.query_map(params![status_str], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }
}

impl AdherenceRepository for SqliteStore {
    fn insert_adherence(&self, event: &AdherenceEvent) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO adherence_events (id, experiment, data) VALUES (?1, ?2, ?3)",
            params![event.id.to_string(), event.experiment.to_string(), to_json(event)?],
        )?;
        Ok(())
    }

    fn adherence_for_experiment(&self, experiment: Uuid) -> Result<Vec<AdherenceEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM adherence_events WHERE experiment = ?1")?;
        let rows = stmt.query_map(params![experiment.to_string()], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }
}

impl EvaluationRepository for SqliteStore {
    fn insert_evaluation(&self, evaluation: &EvaluationResult) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO evaluation_results (id, user, data) VALUES (?1, ?2, ?3)",
            params![evaluation.id.to_string(), evaluation.user, to_json(evaluation)?],
        )?;
        Ok(())
    }

    fn evaluations_for_user(&self, user: &UserId) -> Result<Vec<EvaluationResult>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM evaluation_results WHERE user = ?1")?;
        let rows = stmt.query_map(params![user], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }
}

impl DriverRepository for SqliteStore {
    fn replace_drivers(&self, user: &UserId, drivers: &[PersonalDriver]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM personal_drivers WHERE user = ?1", params![user])?;
        for driver in drivers {
            tx.execute("INSERT INTO personal_drivers (user, data) VALUES (?1, ?2)", params![user, to_json(driver)?])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn drivers_for_user(&self, user: &UserId) -> Result<Vec<PersonalDriver>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM personal_drivers WHERE user = ?1")?;
        let rows = stmt.query_map(params![user], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }
}

impl CausalMemoryRepository for SqliteStore {
    fn get_causal_memory(&self, user: &UserId, driver_key: &str, metric_key: &str) -> Result<Option<CausalMemory>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM causal_memory WHERE user = ?1 AND driver_key = ?2 AND metric_key = ?3",
                params![user, driver_key, metric_key],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    fn upsert_causal_memory(&self, memory: &CausalMemory) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO causal_memory (user, driver_key, metric_key, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user, driver_key, metric_key) DO UPDATE SET data = excluded.data",
            params![memory.user, memory.driver_key, memory.metric_key, to_json(memory)?],
        )?;
        Ok(())
    }

    fn causal_memories_for_user(&self, user: &UserId) -> Result<Vec<CausalMemory>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM causal_memory WHERE user = ?1")?;
        let rows = stmt.query_map(params![user], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }
}

impl NarrativeRepository for SqliteStore {
    fn upsert_narrative(&self, narrative: &Narrative) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let period_type = format!("{:?}", narrative.period_type);
        conn.execute(
            "INSERT INTO narratives (user, period_type, period_start, period_end, data) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user, period_type, period_start, period_end) DO UPDATE SET data = excluded.data",
            params![
                narrative.user,
                period_type,
                narrative.period_start.to_rfc3339(),
                narrative.period_end.to_rfc3339(),
                to_json(narrative)?
            ],
        )?;
        Ok(())
    }

    fn get_narrative(
        &self,
        user: &UserId,
        period_type: PeriodType,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Option<Narrative>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let period_type_str = format!("{:?}", period_type);
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM narratives WHERE user = ?1 AND period_type = ?2 AND period_start = ?3 AND period_end = ?4",
                params![user, period_type_str, period_start.to_rfc3339(), period_end.to_rfc3339()],
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }
}

impl TrustScoreRepository for SqliteStore {
    fn upsert_trust_score(&self, score: &TrustScore) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trust_scores (user, data) VALUES (?1, ?2)
             ON CONFLICT(user) DO UPDATE SET data = excluded.data",
            params![score.user, to_json(score)?],
        )?;
        Ok(())
    }

    fn get_trust_score(&self, user: &UserId) -> Result<Option<TrustScore>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> =
            conn.query_row("SELECT data FROM trust_scores WHERE user = ?1", params![user], |r| r.get(0)).optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }
}

impl JobRunRepository for SqliteStore {
    fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Option<JobRun>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT data FROM job_runs WHERE idempotency_key = ?1", params![idempotency_key], |r| r.get(0))
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    fn insert_job_run(&self, run: &JobRun) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_runs (idempotency_key, data) VALUES (?1, ?2)",
            params![run.idempotency_key, to_json(run)?],
        )?;
        Ok(())
    }

    fn update_job_run(&self, run: &JobRun) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO job_runs (idempotency_key, data) VALUES (?1, ?2)
             ON CONFLICT(idempotency_key) DO UPDATE SET data = excluded.data",
            params![run.idempotency_key, to_json(run)?],
        )?;
        Ok(())
    }
}

impl AuditRepository for SqliteStore {
    fn append_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_events (id, entity_type, entity_id, recorded_at, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![event.id.to_string(), event.entity_type, event.entity_id, event.recorded_at.to_rfc3339(), to_json(event)?],
        )?;
        Ok(())
    }

    fn append_explanation_edge(&self, edge: &ExplanationEdge) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("INSERT INTO explanation_edges (id, data) VALUES (?1, ?2)", params![edge.id.to_string(), to_json(edge)?])?;
        Ok(())
    }

    fn audit_events_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT data FROM audit_events WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY recorded_at ASC")?;
        let rows = stmt.query_map(params![entity_type, entity_id], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?.iter().map(|raw| from_json(raw)).collect()
    }

    fn latest_audit_hash(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> =
            conn.query_row("SELECT data FROM audit_events ORDER BY recorded_at DESC LIMIT 1", [], |r| r.get(0)).optional()?;
        match raw {
            Some(r) => {
                let event: AuditEvent = from_json(&r)?;
                Ok(Some(crate::crypto::hash_sha256(event.id.as_bytes())))
            }
            None => Ok(None),
        }
    }
}

impl ProviderTokenRepository for SqliteStore {
    fn get_provider_token(&self, user: &UserId, provider: &str) -> Result<Option<ProviderToken>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT data FROM provider_tokens WHERE user = ?1 AND provider = ?2", params![user, provider], |r| r.get(0))
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    fn upsert_provider_token(&self, token: &ProviderToken) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO provider_tokens (user, provider, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(user, provider) DO UPDATE SET data = excluded.data",
            params![token.user, token.provider, to_json(token)?],
        )?;
        Ok(())
    }

    fn delete_provider_token(&self, user: &UserId, provider: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM provider_tokens WHERE user = ?1 AND provider = ?2", params![user, provider])?;
        Ok(())
    }
}
