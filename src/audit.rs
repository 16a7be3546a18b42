//! C20: Audit & Explanation.
//!
//! Append-only decision records and explanation edges linking every
//! produced entity (insight, evaluation, narrative) back to the source
//! metrics, windows, detectors, and thresholds that produced it — without
//! needing to recompute anything. Grounded on
//! `original_source/backend/app/domain/repositories/{audit_repository,explanation_repository}.py`.

use crate::models::{AuditEvent, ExplanationEdge};
use serde_json::{json, Value as Json};
use uuid::Uuid;

/// Builder-style constructor mirroring the source repository's `create`
/// kwargs, so call sites at the end of each engine stage stay readable.
#[derive(Debug, Clone, Default)]
pub struct AuditEventBuilder {
    pub user: String,
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
}

impl AuditEventBuilder {
    pub fn new(user: impl Into<String>, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        AuditEventBuilder {
            user: user.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            time_windows: json!({}),
            thresholds_crossed: json!({}),
            metadata: json!({}),
            ..Default::default()
        }
    }

    pub fn decision(mut self, decision_type: impl Into<String>, reason: impl Into<String>) -> Self {
        self.decision_type = decision_type.into();
        self.decision_reason = reason.into();
        self
    }

    pub fn source_metrics(mut self, metrics: Vec<String>) -> Self {
        self.source_metrics = metrics;
        self
    }

    pub fn time_windows(mut self, windows: Json) -> Self {
        self.time_windows = windows;
        self
    }

    pub fn detectors(mut self, detectors: Vec<String>) -> Self {
        self.detectors_used = detectors;
        self
    }

    pub fn thresholds(mut self, thresholds: Json) -> Self {
        self.thresholds_crossed = thresholds;
        self
    }

    pub fn safety_checks(mut self, checks: Vec<String>) -> Self {
        self.safety_checks_applied = checks;
        self
    }

    pub fn metadata(mut self, metadata: Json) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn build(self, recorded_at: chrono::DateTime<chrono::Utc>) -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4(),
            user: self.user,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            decision_type: self.decision_type,
            decision_reason: self.decision_reason,
            source_metrics: self.source_metrics,
            time_windows: self.time_windows,
            detectors_used: self.detectors_used,
            thresholds_crossed: self.thresholds_crossed,
            safety_checks_applied: self.safety_checks_applied,
            metadata: self.metadata,
            recorded_at,
        }
    }
}

/// A link from a produced entity (insight/evaluation/narrative) to one of
/// the source rows or computed artifacts that contributed to it.
pub fn explanation_edge(
    target_type: &str,
    target_id: &str,
    source_type: &str,
    source_id: Option<&str>,
    contribution_weight: f64,
    description: impl Into<String>,
) -> ExplanationEdge {
    ExplanationEdge {
        id: Uuid::new_v4(),
        target_type: target_type.to_string(),
        target_id: target_id.to_string(),
        source_type: source_type.to_string(),
        source_id: source_id.map(|s| s.to_string()),
        contribution_weight,
        description: description.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn builder_produces_populated_event() {
        let event = AuditEventBuilder::new("u1", "insight", "ins-1")
            .decision("change_detected", "z-score exceeded threshold")
            .source_metrics(vec!["sleep_duration".to_string()])
            .detectors(vec!["change".to_string()])
            .build(Utc::now());
        assert_eq!(event.entity_type, "insight");
        assert_eq!(event.decision_type, "change_detected");
        assert_eq!(event.source_metrics, vec!["sleep_duration".to_string()]);
    }

    #[test]
    fn edge_links_target_and_source() {
        let edge = explanation_edge("insight", "ins-1", "health_data_point", Some("hdp-1"), 0.8, "recent window value");
        assert_eq!(edge.target_id, "ins-1");
        assert_eq!(edge.source_id, Some("hdp-1".to_string()));
        assert!((edge.contribution_weight - 0.8).abs() < 1e-9);
    }
}
