//! C9: Safety Gate, plus Intervention safety evaluation (spec.md §3
//! Intervention: "Safety decision computed at creation; high-risk
//! interventions are hard-blocked").
//!
//! Grounded on `original_source/backend/app/domain/safety/red_flags.py`
//! (rule table + evaluation) and
//! `original_source/backend/app/engine/safety/safety_service.py`
//! (per-intervention contraindication/interaction evaluation).

use crate::models::{EvidenceGrade, InterventionSafety, RiskLevel, SafetyBoundary, SafetyIssue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================
// Red-flag rules (C9)
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Metric,
    Lab,
    Symptom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Lt,
    Gt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAction {
    Monitor,
    ContactDoctor,
    SeekCareNow,
}

pub struct RedFlagRule {
    pub key: &'static str,
    pub metric_key: Option<&'static str>,
    pub kind: RuleKind,
    pub condition: Condition,
    pub threshold: f64,
    pub severity: Severity,
    pub action: SafetyAction,
    pub message: &'static str,
}

static RULES: &[RedFlagRule] = &[
    RedFlagRule {
        key: "sleep_very_low",
        metric_key: Some("sleep_duration"),
        kind: RuleKind::Metric,
        condition: Condition::Lt,
        threshold: 240.0,
        severity: Severity::High,
        action: SafetyAction::ContactDoctor,
        message: "Very low sleep duration detected (under 4 hours). If this is persistent or severe, consider medical advice.",
    },
    RedFlagRule {
        key: "resting_hr_high",
        metric_key: Some("resting_hr"),
        kind: RuleKind::Metric,
        condition: Condition::Gt,
        threshold: 110.0,
        severity: Severity::Urgent,
        action: SafetyAction::SeekCareNow,
        message: "High resting heart rate detected (>110 bpm). If you feel unwell (chest pain, fainting, shortness of breath), seek urgent care.",
    },
    RedFlagRule {
        key: "hrv_very_low",
        metric_key: Some("hrv_rmssd"),
        kind: RuleKind::Metric,
        condition: Condition::Lt,
        threshold: 15.0,
        severity: Severity::Medium,
        action: SafetyAction::Monitor,
        message: "Very low HRV detected. If combined with severe symptoms or illness, consider medical advice.",
    },
    RedFlagRule {
        key: "glucose_very_high",
        metric_key: Some("glucose_mgdl"),
        kind: RuleKind::Lab,
        condition: Condition::Gt,
        threshold: 300.0,
        severity: Severity::Urgent,
        action: SafetyAction::SeekCareNow,
        message: "Very high glucose detected. This can be dangerous. Seek medical care urgently, especially if symptomatic.",
    },
];

const CRISIS_SYMPTOM_TAGS: &[&str] = &["suicidal_ideation", "self_harm_thoughts"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredRule {
    pub key: String,
    pub metric_key: Option<String>,
    pub severity: Severity,
    pub action: SafetyAction,
    pub message: String,
    pub value: Option<f64>,
}

/// Evaluate every red-flag rule over the latest 3-day metric averages and
/// the current symptom tag set. Returns rules sorted urgent-first
/// (spec.md §4.6).
pub fn evaluate_red_flags(
    latest_metrics: &std::collections::BTreeMap<String, f64>,
    symptom_tags: &[String],
) -> Vec<TriggeredRule> {
    let mut triggered = Vec::new();

    for rule in RULES {
        match rule.kind {
            RuleKind::Metric | RuleKind::Lab => {
                let Some(metric_key) = rule.metric_key else { continue };
                let Some(&value) = latest_metrics.get(metric_key) else { continue };
                let fires = match rule.condition {
                    Condition::Lt => value < rule.threshold,
                    Condition::Gt => value > rule.threshold,
                };
                if fires {
                    triggered.push(TriggeredRule {
                        key: rule.key.to_string(),
                        metric_key: Some(metric_key.to_string()),
                        severity: rule.severity,
                        action: rule.action,
                        message: rule.message.to_string(),
                        value: Some(value),
                    });
                }
            }
            RuleKind::Symptom => {
                let symptom_set: BTreeSet<&str> = symptom_tags.iter().map(|s| s.as_str()).collect();
                if CRISIS_SYMPTOM_TAGS.iter().any(|t| symptom_set.contains(t)) {
                    triggered.push(TriggeredRule {
                        key: rule.key.to_string(),
                        metric_key: None,
                        severity: rule.severity,
                        action: rule.action,
                        message: rule.message.to_string(),
                        value: None,
                    });
                }
            }
        }
    }

    triggered.sort_by(|a, b| b.severity.cmp(&a.severity));
    triggered
}

// ============================================
// Intervention safety evaluation
// ============================================

#[derive(Debug, Clone)]
pub struct InterventionSpec {
    pub key: &'static str,
    pub display_name: &'static str,
    pub default_risk: RiskLevel,
    pub evidence_grade: EvidenceGrade,
    pub contraindications: &'static [&'static str],
    pub interactions: &'static [&'static str],
}

static INTERVENTION_REGISTRY: &[InterventionSpec] = &[
    InterventionSpec {
        key: "magnesium_glycinate",
        display_name: "Magnesium Glycinate",
        default_risk: RiskLevel::Low,
        evidence_grade: EvidenceGrade::B,
        contraindications: &["kidney_disease"],
        interactions: &["diuretic_use"],
    },
    InterventionSpec {
        key: "melatonin",
        display_name: "Melatonin",
        default_risk: RiskLevel::Low,
        evidence_grade: EvidenceGrade::B,
        contraindications: &["pregnancy"],
        interactions: &["sedative_use"],
    },
    InterventionSpec {
        key: "intense_fasting_protocol",
        display_name: "Extended Fasting Protocol",
        default_risk: RiskLevel::High,
        evidence_grade: EvidenceGrade::D,
        contraindications: &["diabetes", "eating_disorder_history", "pregnancy"],
        interactions: &[],
    },
];

pub fn get_intervention_spec(key: &str) -> Option<&'static InterventionSpec> {
    INTERVENTION_REGISTRY.iter().find(|s| s.key == key)
}

fn max_risk(a: RiskLevel, b: RiskLevel) -> RiskLevel {
    fn rank(r: RiskLevel) -> u8 {
        match r {
            RiskLevel::Low => 0,
            RiskLevel::Moderate => 1,
            RiskLevel::High => 2,
        }
    }
    if rank(a) >= rank(b) { a } else { b }
}

/// Evaluate an intervention's safety given a user's known flags. Unknown
/// interventions are allowed but downgraded to experimental/grade D
/// (source's conservative default). High-risk contraindications hard-block
/// (`allowed=false` is surfaced by the caller refusing to persist the
/// intervention, spec.md §3).
pub fn evaluate_intervention(
    intervention_key: &str,
    user_flags: &BTreeSet<String>,
    requested_boundary: Option<SafetyBoundary>,
) -> (bool, InterventionSafety) {
    let Some(spec) = get_intervention_spec(intervention_key) else {
        return (
            true,
            InterventionSafety {
                risk_level: RiskLevel::Moderate,
                evidence_grade: EvidenceGrade::D,
                boundary: SafetyBoundary::Experiment,
                issues: vec![SafetyIssue {
                    code: "unknown_intervention".to_string(),
                    message: "This intervention is not in the safety registry yet. Treat as experimental and proceed cautiously.".to_string(),
                }],
            },
        );
    };

    let mut issues = Vec::new();
    let mut risk = spec.default_risk;
    let mut hard_blocked = false;

    for c in spec.contraindications {
        if user_flags.contains(*c) {
            issues.push(SafetyIssue {
                code: "contraindication".to_string(),
                message: format!("user has contraindication flag '{c}' for {}", spec.display_name),
            });
            risk = max_risk(risk, RiskLevel::High);
            hard_blocked = true;
        }
    }

    for i in spec.interactions {
        if user_flags.contains(*i) {
            issues.push(SafetyIssue {
                code: "interaction".to_string(),
                message: format!("user has interaction flag '{i}' for {}", spec.display_name),
            });
            risk = max_risk(risk, RiskLevel::Moderate);
        }
    }

    let boundary = requested_boundary.unwrap_or(if risk == RiskLevel::Low {
        SafetyBoundary::Lifestyle
    } else {
        SafetyBoundary::Experiment
    });

    let allowed = !hard_blocked;

    (
        allowed,
        InterventionSafety {
            risk_level: risk,
            evidence_grade: spec.evidence_grade,
            boundary,
            issues,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn resting_hr_115_triggers_urgent() {
        let mut metrics = BTreeMap::new();
        metrics.insert("resting_hr".to_string(), 115.0);
        let triggered = evaluate_red_flags(&metrics, &[]);
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].severity, Severity::Urgent);
        assert_eq!(triggered[0].action, SafetyAction::SeekCareNow);
    }

    #[test]
    fn no_rules_trigger_on_normal_values() {
        let mut metrics = BTreeMap::new();
        metrics.insert("resting_hr".to_string(), 65.0);
        assert!(evaluate_red_flags(&metrics, &[]).is_empty());
    }

    #[test]
    fn urgent_sorts_before_medium() {
        let mut metrics = BTreeMap::new();
        metrics.insert("hrv_rmssd".to_string(), 10.0);
        metrics.insert("resting_hr".to_string(), 120.0);
        let triggered = evaluate_red_flags(&metrics, &[]);
        assert_eq!(triggered[0].severity, Severity::Urgent);
        assert_eq!(triggered.last().unwrap().severity, Severity::Medium);
    }

    #[test]
    fn crisis_symptom_tag_triggers_urgent() {
        let triggered = evaluate_red_flags(&BTreeMap::new(), &["suicidal_ideation".to_string()]);
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].severity, Severity::Urgent);
        assert!(triggered[0].metric_key.is_none());
    }

    #[test]
    fn high_risk_contraindication_hard_blocks() {
        let mut flags = BTreeSet::new();
        flags.insert("diabetes".to_string());
        let (allowed, safety) = evaluate_intervention("intense_fasting_protocol", &flags, None);
        assert!(!allowed);
        assert_eq!(safety.risk_level, RiskLevel::High);
    }

    #[test]
    fn low_risk_intervention_without_flags_is_allowed() {
        let (allowed, safety) = evaluate_intervention("magnesium_glycinate", &BTreeSet::new(), None);
        assert!(allowed);
        assert_eq!(safety.boundary, SafetyBoundary::Lifestyle);
    }

    #[test]
    fn unknown_intervention_downgrades_to_experimental() {
        let (allowed, safety) = evaluate_intervention("unregistered_thing", &BTreeSet::new(), None);
        assert!(allowed);
        assert_eq!(safety.evidence_grade, EvidenceGrade::D);
        assert_eq!(safety.boundary, SafetyBoundary::Experiment);
    }
}
