//! C5: Provider Normalizer.
//!
//! A single `NormalizedPoint` shape that every provider adapter must
//! produce before data reaches the Ingestion Service, plus the trait
//! adapters implement and a unit-conversion table. Grounded on
//! `original_source/backend/app/providers/base.py` and
//! `original_source/backend/app/providers/whoop/whoop_adapter.py`.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A single data point after a provider adapter has translated its native
/// payload into our canonical shape. Every field here must be present —
/// partial points are rejected upstream in the Data Quality Scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPoint {
    pub metric_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("provider '{0}' returned no client credentials")]
    MissingCredentials(String),
    #[error("unrecognized unit '{got}' for metric '{metric}', expected '{expected}'")]
    UnitMismatch {
        metric: String,
        got: String,
        expected: String,
    },
    #[error("upstream provider error: {0}")]
    Upstream(String),
}

/// Implemented by each provider integration (wearables, lab panels, manual
/// entry). Adapters are intentionally synchronous at this boundary — the
/// async HTTP fetch that feeds them lives in the provider sync job, not here.
pub trait ProviderAdapter {
    fn provider_name(&self) -> &'static str;
    fn normalize(&self, raw_payload: &str) -> Result<Vec<NormalizedPoint>, NormalizeError>;
}

/// Converts `value` in `from_unit` to the metric's canonical unit, if a
/// conversion is known. Returns `None` when no conversion is defined, which
/// callers treat as a consistency failure rather than a silent pass-through.
pub fn convert_unit(metric: &str, value: f64, from_unit: &str, to_unit: &str) -> Option<f64> {
    if from_unit == to_unit {
        return Some(value);
    }
    match (metric, from_unit, to_unit) {
        ("sleep_duration", "hours", "minutes") => Some(value * 60.0),
        ("sleep_duration", "seconds", "minutes") => Some(value / 60.0),
        ("glucose_mgdl", "mmol/L", "mg/dL") => Some(value * 18.0182),
        ("resting_hr", "bpm", "bpm") => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_conversion_passes_through() {
        assert_eq!(convert_unit("steps", 100.0, "count", "count"), Some(100.0));
    }

    #[test]
    fn hours_to_minutes() {
        assert_eq!(convert_unit("sleep_duration", 7.5, "hours", "minutes"), Some(450.0));
    }

    #[test]
    fn unknown_conversion_is_none() {
        assert_eq!(convert_unit("steps", 1.0, "miles", "count"), None);
    }

    #[test]
    fn mmol_to_mgdl() {
        let converted = convert_unit("glucose_mgdl", 5.5, "mmol/L", "mg/dL").unwrap();
        assert!((converted - 99.1).abs() < 0.1);
    }
}
