//! Shared data model for the analytics core.
//!
//! These types are persisted verbatim by the `store` module; no hidden
//! computed state lives on them. Free-form context that never drives
//! control flow goes in an opaque `metadata` JSON blob — everything else
//! is a typed field (see spec.md §9, "Replacements for source idioms").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type UserId = String;

// ============================================
// Consent
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consent {
    pub user: UserId,
    pub version: String,
    pub data_analysis: bool,
    pub experimental_recommendations: bool,
    pub stop_anytime: bool,
    /// Per-vendor provider-ingestion scopes, decoupled from `data_analysis`.
    pub provider_ingestion: BTreeMap<String, bool>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl Consent {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

// ============================================
// Health data
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDataPoint {
    pub id: Uuid,
    pub user: UserId,
    pub metric_key: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub provenance_id: Uuid,
    pub quality_score: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataProvenance {
    pub id: Uuid,
    pub user: UserId,
    pub source_type: String,
    pub source_name: String,
    pub source_record_id: Option<String>,
    pub ingestion_run_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub quality_score: f64,
    pub validation_errors: Vec<String>,
}

/// Daily self-report check-in: behavioral features for attribution plus the
/// symptom tag set consumed by the Safety Gate (supplements spec.md §4.6/§4.10,
/// grounded on original_source daily_checkin_repository.py / symptom_repository.py).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DailyCheckIn {
    pub user: UserId,
    pub date: chrono::NaiveDate,
    pub behaviors: BTreeMap<String, f64>,
    pub symptom_tags: Vec<String>,
    pub notes_present: bool,
}

/// Encrypted OAuth credential for one (user, provider) pair (spec.md §6
/// "Provider token storage"). `*_encrypted` fields are hex-encoded
/// `crypto::EncryptedBlob`s; only `crypto::decrypt_provider_token` ever
/// sees the plaintext, and only at the moment of use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderToken {
    pub user: UserId,
    pub provider: String,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: Option<String>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================
// Baseline
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub user: UserId,
    pub metric_key: String,
    pub mean: f64,
    pub std: f64,
    pub sample_count: usize,
    pub window_days: u32,
    pub computed_at: DateTime<Utc>,
}

// ============================================
// Insight
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Change,
    Trend,
    Instability,
    Safety,
    InsufficientData,
    Attribution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: Uuid,
    pub user: UserId,
    pub insight_type: InsightType,
    pub metric_key: String,
    pub domain_key: String,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub claim_level: u8,
    pub evidence: Json,
    pub generated_at: DateTime<Utc>,
    pub suppressed: bool,
    pub suppression_reason: Option<String>,
    pub policy_sanitized: bool,
}

// ============================================
// Intervention / safety
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvidenceGrade {
    A,
    B,
    C,
    D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyBoundary {
    Informational,
    Lifestyle,
    Experiment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyIssue {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionSafety {
    pub risk_level: RiskLevel,
    pub evidence_grade: EvidenceGrade,
    pub boundary: SafetyBoundary,
    pub issues: Vec<SafetyIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intervention {
    pub id: Uuid,
    pub user: UserId,
    pub key: String,
    pub name: String,
    pub dosage: Option<String>,
    pub schedule: Option<String>,
    pub safety: InterventionSafety,
}

// ============================================
// Experiment / adherence / evaluation
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Active,
    Stopped,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub user: UserId,
    pub intervention: String,
    pub primary_metric: String,
    pub expected_direction: Option<Direction>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ExperimentStatus,
    pub baseline_window_days: u32,
    pub intervention_window_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdherenceEvent {
    pub id: Uuid,
    pub user: UserId,
    pub experiment: Uuid,
    pub timestamp: DateTime<Utc>,
    pub taken: bool,
    pub dose: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Helpful,
    NotHelpful,
    Unclear,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowStats {
    pub mean: f64,
    pub std: f64,
    pub n: usize,
    pub coverage: f64,
    pub ci_low: f64,
    pub ci_high: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationDetails {
    pub baseline_window: (DateTime<Utc>, DateTime<Utc>),
    pub intervention_window: (DateTime<Utc>, DateTime<Utc>),
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub id: Uuid,
    pub user: UserId,
    pub experiment: Uuid,
    pub metric_key: String,
    pub baseline: WindowStats,
    pub intervention: WindowStats,
    pub delta: f64,
    pub percent_change: f64,
    pub effect_size_d: f64,
    pub adherence_rate: f64,
    pub confidence_score: f64,
    pub verdict: Verdict,
    pub details: EvaluationDetails,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Personal drivers / causal memory
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalDriver {
    pub id: Uuid,
    pub user: UserId,
    pub driver_key: String,
    pub driver_type: String,
    pub outcome_metric: String,
    pub lag_days: u32,
    pub effect_size: f64,
    pub direction: Direction,
    pub variance_explained: f64,
    pub confidence: f64,
    pub stability: f64,
    pub sample_size: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalMemoryStatus {
    Tentative,
    Confirmed,
    Deprecated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportingEvaluation {
    pub evaluation_id: Uuid,
    pub effect_size: f64,
    pub direction: Direction,
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalMemory {
    pub user: UserId,
    pub driver_key: String,
    pub metric_key: String,
    pub direction: Direction,
    pub avg_effect_size: f64,
    pub confidence: f64,
    pub evidence_count: u32,
    pub status: CausalMemoryStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    pub supporting_evaluations: Vec<SupportingEvaluation>,
}

// ============================================
// Narrative / trust
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPoint {
    pub text: String,
    pub metric_key: String,
    pub domain_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeAction {
    pub action: String,
    pub rationale: String,
    pub metric_key: String,
    pub claim_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeRisk {
    pub text: String,
    pub severity: String,
    pub metric_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainStatus {
    NoData,
    BaselineBuilding,
    NoSignalDetected,
    SignalDetected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeMetadata {
    pub domain_statuses: BTreeMap<String, DomainStatus>,
    pub coverage: f64,
    pub counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Narrative {
    pub id: Uuid,
    pub user: UserId,
    pub period_type: PeriodType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub title: String,
    pub summary: String,
    pub key_points: Vec<KeyPoint>,
    pub drivers: Vec<String>,
    pub actions: Vec<NarrativeAction>,
    pub risks: Vec<NarrativeRisk>,
    pub metadata: NarrativeMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustComponents {
    pub data_coverage: f64,
    pub adherence: f64,
    pub evaluation_success: f64,
    pub stability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustScore {
    pub user: UserId,
    pub overall: f64,
    pub components: TrustComponents,
    pub last_updated_at: DateTime<Utc>,
}

// ============================================
// Scheduler
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: String,
    pub idempotency_key: String,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result_summary: Option<String>,
    pub error: Option<String>,
}

// ============================================
// Audit & explanation
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub user: UserId,
    pub entity_type: String,
    pub entity_id: String,
    pub decision_type: String,
    pub decision_reason: String,
    pub source_metrics: Vec<String>,
    pub time_windows: Json,
    pub detectors_used: Vec<String>,
    pub thresholds_crossed: Json,
    pub safety_checks_applied: Vec<String>,
    pub metadata: Json,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplanationEdge {
    pub id: Uuid,
    pub target_type: String,
    pub target_id: String,
    pub source_type: String,
    pub source_id: Option<String>,
    pub contribution_weight: f64,
    pub description: String,
}
