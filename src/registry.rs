//! C1: Metric Registry.
//!
//! Canonical metric definitions: unit, valid range, direction, cadence.
//! Immutable at runtime; loaded once into a `lazy_static` map (teacher's
//! `lazy_static::PATTERNS` convention in the former ethics module), grounded
//! on `original_source/backend/app/domain/metrics/registry.py`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherBetter,
    LowerBetter,
    OptimalRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Mean,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Hourly,
    Daily,
    Continuous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    pub key: &'static str,
    pub domain: &'static str,
    pub display_name: &'static str,
    pub unit: &'static str,
    pub valid_range: (f64, f64),
    pub direction: Direction,
    pub optimal_range: Option<(f64, f64)>,
    pub aggregation: Aggregation,
    pub expected_cadence: Cadence,
}

impl MetricSpec {
    pub fn min_value(&self) -> f64 {
        self.valid_range.0
    }

    pub fn max_value(&self) -> f64 {
        self.valid_range.1
    }

    pub fn in_range(&self, value: f64) -> bool {
        value >= self.valid_range.0 && value <= self.valid_range.1
    }
}

lazy_static::lazy_static! {
    static ref REGISTRY: BTreeMap<&'static str, MetricSpec> = {
        let mut m = BTreeMap::new();
        for spec in METRIC_DEFS.iter().cloned() {
            m.insert(spec.key, spec);
        }
        m
    };
}

// Keep as a plain slice literal first so both the lazy map and `list_metrics`
// iterate registration order deterministically (spec.md §5, "registry
// iteration order" used to sequence detector output within a loop run).
static METRIC_DEFS: &[MetricSpec] = &[
    MetricSpec {
        key: "sleep_duration",
        domain: "sleep",
        display_name: "Sleep Duration",
        unit: "minutes",
        valid_range: (0.0, 1000.0),
        direction: Direction::HigherBetter,
        optimal_range: None,
        aggregation: Aggregation::Sum,
        expected_cadence: Cadence::Daily,
    },
    MetricSpec {
        key: "sleep_efficiency",
        domain: "sleep",
        display_name: "Sleep Efficiency",
        unit: "percent",
        valid_range: (0.0, 100.0),
        direction: Direction::HigherBetter,
        optimal_range: None,
        aggregation: Aggregation::Mean,
        expected_cadence: Cadence::Daily,
    },
    MetricSpec {
        key: "resting_hr",
        domain: "cardiometabolic",
        display_name: "Resting Heart Rate",
        unit: "bpm",
        valid_range: (20.0, 200.0),
        direction: Direction::LowerBetter,
        optimal_range: None,
        aggregation: Aggregation::Mean,
        expected_cadence: Cadence::Daily,
    },
    MetricSpec {
        key: "hrv_rmssd",
        domain: "stress_nervous_system",
        display_name: "Heart Rate Variability (RMSSD)",
        unit: "ms",
        valid_range: (0.0, 300.0),
        direction: Direction::HigherBetter,
        optimal_range: None,
        aggregation: Aggregation::Mean,
        expected_cadence: Cadence::Daily,
    },
    MetricSpec {
        key: "steps",
        domain: "activity",
        display_name: "Steps",
        unit: "count",
        valid_range: (0.0, 100_000.0),
        direction: Direction::HigherBetter,
        optimal_range: None,
        aggregation: Aggregation::Sum,
        expected_cadence: Cadence::Daily,
    },
    MetricSpec {
        key: "sleep_quality",
        domain: "sleep",
        display_name: "Sleep Quality (1-5)",
        unit: "score_1_5",
        valid_range: (1.0, 5.0),
        direction: Direction::HigherBetter,
        optimal_range: None,
        aggregation: Aggregation::Mean,
        expected_cadence: Cadence::Daily,
    },
    MetricSpec {
        key: "energy",
        domain: "energy_fatigue",
        display_name: "Energy (1-5)",
        unit: "score_1_5",
        valid_range: (1.0, 5.0),
        direction: Direction::HigherBetter,
        optimal_range: None,
        aggregation: Aggregation::Mean,
        expected_cadence: Cadence::Daily,
    },
    MetricSpec {
        key: "stress",
        domain: "stress_nervous_system",
        display_name: "Stress (1-5)",
        unit: "score_1_5",
        valid_range: (1.0, 5.0),
        direction: Direction::LowerBetter,
        optimal_range: None,
        aggregation: Aggregation::Mean,
        expected_cadence: Cadence::Daily,
    },
    MetricSpec {
        key: "glucose_mgdl",
        domain: "cardiometabolic",
        display_name: "Blood Glucose",
        unit: "mg/dL",
        valid_range: (40.0, 500.0),
        direction: Direction::OptimalRange,
        optimal_range: Some((70.0, 140.0)),
        aggregation: Aggregation::Mean,
        expected_cadence: Cadence::Daily,
    },
];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("metric '{0}' not registered")]
    NotFound(String),
}

pub fn get_metric_spec(key: &str) -> Result<&'static MetricSpec, RegistryError> {
    REGISTRY
        .get(key)
        .ok_or_else(|| RegistryError::NotFound(key.to_string()))
}

/// Registration-order metric keys — used by the Loop Runner (C11) to fix
/// deterministic insight persistence order (spec.md §5).
pub fn list_metrics() -> Vec<&'static str> {
    METRIC_DEFS.iter().map(|s| s.key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_metric_resolves() {
        let spec = get_metric_spec("sleep_duration").unwrap();
        assert_eq!(spec.unit, "minutes");
        assert_eq!(spec.direction, Direction::HigherBetter);
    }

    #[test]
    fn unknown_metric_errors() {
        assert!(get_metric_spec("not_a_metric").is_err());
    }

    #[test]
    fn list_metrics_is_deterministic() {
        let a = list_metrics();
        let b = list_metrics();
        assert_eq!(a, b);
        assert!(a.contains(&"sleep_duration"));
    }

    #[test]
    fn range_check() {
        let spec = get_metric_spec("resting_hr").unwrap();
        assert!(spec.in_range(60.0));
        assert!(!spec.in_range(500.0));
    }
}
