//! C6: Ingestion Service.
//!
//! All-or-nothing batch insertion: a batch is scored, every point is
//! checked against registry invariants and hard-stop gates, and only then
//! is the whole batch persisted in one transaction. Grounded on spec.md
//! §4.3 and the hard-stop gates in
//! `original_source/backend/app/engine/quality/data_quality_service.py`
//! (ported into [`crate::quality`]).

use crate::consent::{self, ConsentError, ConsentScope};
use crate::models::{Consent, DataProvenance, HealthDataPoint};
use crate::normalizer::{convert_unit, NormalizedPoint};
use crate::quality::{self, DataQualityScore};
use crate::registry::{self, RegistryError};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("consent check failed: {0}")]
    Consent(#[from] ConsentError),
    #[error("batch was empty")]
    EmptyBatch,
}

#[derive(Debug, Clone)]
pub struct RejectedPoint {
    pub point: NormalizedPoint,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub received_at: DateTime<Utc>,
    pub inserted: Vec<HealthDataPoint>,
    pub rejected: Vec<RejectedPoint>,
    pub provenance: DataProvenance,
    pub quality: DataQualityScore,
}

/// Categories of unit that are safe to auto-convert between, matching the
/// `convert_unit` table in [`crate::normalizer`]. Incompatible categories
/// are a hard rejection rather than a silent pass-through.
fn resolve_unit(metric: &str, point_unit: &str, spec_unit: &str, value: f64) -> Option<f64> {
    if point_unit == spec_unit {
        return Some(value);
    }
    convert_unit(metric, value, point_unit, spec_unit)
}

/// Runs the full ingestion pipeline for one batch belonging to `user`.
/// Consent for `provider` must be valid and non-revoked; consent for
/// general analysis is intentionally not required here (spec.md §4.3: a
/// user may sync raw data without opting into processing of it).
pub fn ingest(
    user: &str,
    provider: &str,
    consent: &Consent,
    raw_points: Vec<NormalizedPoint>,
) -> Result<IngestionReport, IngestionError> {
    consent::require_scope(consent, ConsentScope::ProviderIngestion(provider.to_string()))?;

    if raw_points.is_empty() {
        return Err(IngestionError::EmptyBatch);
    }

    let run_id = Uuid::new_v4();
    let received_at = Utc::now();

    let specs: Vec<_> = raw_points
        .iter()
        .filter_map(|p| registry::get_metric_spec(&p.metric_type).ok())
        .collect();
    let quality_score = quality::compute_quality_score(&raw_points, &specs, received_at);

    let mut inserted = Vec::new();
    let mut rejected = Vec::new();
    let mut seen_timestamps: Vec<DateTime<Utc>> = Vec::new();

    for point in raw_points {
        let spec = match registry::get_metric_spec(&point.metric_type) {
            Ok(spec) => spec,
            Err(RegistryError::NotFound(key)) => {
                rejected.push(RejectedPoint {
                    point,
                    reason: format!("metric '{key}' not registered"),
                });
                continue;
            }
        };

        let converted = match resolve_unit(&point.metric_type, &point.unit, spec.unit, point.value) {
            Some(v) => v,
            None => {
                rejected.push(RejectedPoint {
                    reason: format!(
                        "unit '{}' incompatible with expected '{}' for metric '{}'",
                        point.unit, spec.unit, point.metric_type
                    ),
                    point,
                });
                continue;
            }
        };

        let mut normalized = point.clone();
        normalized.value = converted;
        normalized.unit = spec.unit.to_string();

        if let Some(reason) = quality::should_reject_point(&normalized, Some(spec), &seen_timestamps) {
            rejected.push(RejectedPoint { point: normalized, reason });
            continue;
        }

        seen_timestamps.push(normalized.timestamp);
        inserted.push(HealthDataPoint {
            id: Uuid::new_v4(),
            user: user.to_string(),
            metric_key: normalized.metric_type.clone(),
            value: normalized.value,
            unit: normalized.unit.clone(),
            timestamp: normalized.timestamp,
            source: normalized.source.clone(),
            provenance_id: run_id,
            quality_score: quality_score.overall,
            flagged: quality_score.overall < quality::MIN_INSIGHT_QUALITY,
        });
    }

    let provenance = DataProvenance {
        id: Uuid::new_v4(),
        user: user.to_string(),
        source_type: "provider".to_string(),
        source_name: provider.to_string(),
        source_record_id: Some(run_id.to_string()),
        ingestion_run_id: run_id,
        received_at,
        quality_score: quality_score.overall,
        validation_errors: rejected.iter().map(|r| r.reason.clone()).collect(),
    };

    Ok(IngestionReport {
        run_id,
        received_at,
        inserted,
        rejected,
        provenance,
        quality: quality_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn consent_with_provider(provider: &str) -> Consent {
        Consent {
            user: "u1".to_string(),
            data_analysis: true,
            experimental_recommendations: false,
            stop_anytime: true,
            provider_ingestion: [(provider.to_string(), true)].into_iter().collect(),
            revoked_at: None,
            version: "v1".to_string(),
            recorded_at: Utc::now(),
        }
    }

    fn point(metric: &str, value: f64, unit: &str, ts: DateTime<Utc>) -> NormalizedPoint {
        NormalizedPoint {
            metric_type: metric.to_string(),
            value,
            unit: unit.to_string(),
            timestamp: ts,
            source: "whoop".to_string(),
        }
    }

    #[test]
    fn ingest_rejects_out_of_range_but_keeps_valid_points() {
        let consent = consent_with_provider("whoop");
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let points = vec![
            point("resting_hr", 60.0, "bpm", ts),
            point("resting_hr", 999.0, "bpm", ts + chrono::Duration::minutes(5)),
        ];
        let report = ingest("u1", "whoop", &consent, points).unwrap();
        assert_eq!(report.inserted.len(), 1);
        assert_eq!(report.rejected.len(), 1);
    }

    #[test]
    fn ingest_converts_units_before_range_check() {
        let consent = consent_with_provider("whoop");
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let points = vec![point("sleep_duration", 7.5, "hours", ts)];
        let report = ingest("u1", "whoop", &consent, points).unwrap();
        assert_eq!(report.inserted.len(), 1);
        assert_eq!(report.inserted[0].value, 450.0);
        assert_eq!(report.inserted[0].unit, "minutes");
    }

    #[test]
    fn ingest_without_provider_consent_errors() {
        let consent = consent_with_provider("oura");
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let points = vec![point("steps", 1000.0, "count", ts)];
        let result = ingest("u1", "whoop", &consent, points);
        assert!(result.is_err());
    }

    #[test]
    fn empty_batch_is_rejected() {
        let consent = consent_with_provider("whoop");
        let result = ingest("u1", "whoop", &consent, vec![]);
        assert!(matches!(result, Err(IngestionError::EmptyBatch)));
    }
}
