//! C3: Claim Policy.
//!
//! A pure function mapping `EvidenceGrade` to a policy record of allowed
//! verbs/modifiers/actions, plus a parallel claim-level (1..5) table.
//! Language validation runs a disallowed-phrase / uncertainty-marker scan,
//! matching the teacher's `policy.rs` approach of keeping organization
//! policy as data, not code, and
//! `original_source/backend/app/domain/claims/claim_policy.py` for the
//! grade tables and thresholds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use crate::models::EvidenceGrade;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStrength {
    Weak,
    Moderate,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAction {
    SurfaceInsight,
    SuggestAction,
    RecommendExperiment,
    EscalateToClinician,
}

#[derive(Debug, Clone)]
pub struct GradePolicy {
    pub grade: EvidenceGrade,
    pub strength: ClaimStrength,
    pub allowed_verbs: &'static [&'static str],
    pub allowed_modifiers: &'static [&'static str],
    pub disallowed_verbs: &'static [&'static str],
    pub uncertainty_required: bool,
    pub allowed_actions: &'static [ClaimAction],
}

fn policy_for(grade: EvidenceGrade) -> GradePolicy {
    match grade {
        EvidenceGrade::A => GradePolicy {
            grade,
            strength: ClaimStrength::Strong,
            allowed_verbs: &[
                "improves", "increases", "decreases", "reduces", "enhances",
                "correlates with", "is associated with", "shows",
            ],
            allowed_modifiers: &["significantly", "consistently", "reliably"],
            disallowed_verbs: &["causes", "guarantees", "ensures", "proves"],
            uncertainty_required: false,
            allowed_actions: &[
                ClaimAction::SurfaceInsight,
                ClaimAction::SuggestAction,
                ClaimAction::RecommendExperiment,
            ],
        },
        EvidenceGrade::B => GradePolicy {
            grade,
            strength: ClaimStrength::Moderate,
            allowed_verbs: &[
                "appears to improve", "may increase", "suggests",
                "is associated with", "tends to", "shows",
            ],
            allowed_modifiers: &["likely", "probably", "often"],
            disallowed_verbs: &["causes", "guarantees", "ensures", "proves", "definitely"],
            uncertainty_required: true,
            allowed_actions: &[ClaimAction::SurfaceInsight, ClaimAction::SuggestAction],
        },
        EvidenceGrade::C => GradePolicy {
            grade,
            strength: ClaimStrength::Weak,
            allowed_verbs: &[
                "might improve", "could increase", "possibly",
                "may be associated with", "suggests a potential",
            ],
            allowed_modifiers: &["possibly", "potentially", "uncertain"],
            disallowed_verbs: &[
                "improves", "increases", "causes", "guarantees", "ensures", "proves",
                "definitely", "significantly", "consistently",
            ],
            uncertainty_required: true,
            allowed_actions: &[ClaimAction::SurfaceInsight],
        },
        EvidenceGrade::D => GradePolicy {
            grade,
            strength: ClaimStrength::Weak,
            allowed_verbs: &[
                "might suggest", "could indicate", "possibly hints at",
                "uncertain association with",
            ],
            allowed_modifiers: &["uncertain", "unclear", "inconclusive", "limited evidence"],
            disallowed_verbs: &[
                "improves", "increases", "causes", "guarantees", "ensures", "proves",
                "definitely", "significantly", "consistently", "appears to",
            ],
            uncertainty_required: true,
            allowed_actions: &[ClaimAction::SurfaceInsight],
        },
    }
}

/// Parallel claim-level (1..5) scale: observational, correlational,
/// attributed, evaluated, reconfirmed (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClaimLevel {
    Observational = 1,
    Correlational = 2,
    Attributed = 3,
    Evaluated = 4,
    Reconfirmed = 5,
}

impl ClaimLevel {
    pub fn from_u8(n: u8) -> ClaimLevel {
        match n.clamp(1, 5) {
            1 => ClaimLevel::Observational,
            2 => ClaimLevel::Correlational,
            3 => ClaimLevel::Attributed,
            4 => ClaimLevel::Evaluated,
            _ => ClaimLevel::Reconfirmed,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Confidence -> claim-level mapping.
///
/// Open Question (spec.md §9): the source uses `floor(c*5)+1` in one place
/// and `clamp(1,5,int(c*5)+1)` in another. We standardize on
/// `clamp(1, 5, floor(confidence*5)+1)` everywhere in this crate (see
/// DESIGN.md) — `floor` and `int`-truncation agree for all non-negative
/// confidence values, so the clamp is the only behavior difference and we
/// keep it since confidence is occasionally allowed to reach exactly 1.0.
pub fn claim_level_from_confidence(confidence: f64) -> u8 {
    let raw = (confidence * 5.0).floor() as i64 + 1;
    raw.clamp(1, 5) as u8
}

fn level_allowed_actions(level: u8) -> &'static [ClaimAction] {
    match level {
        1 => &[ClaimAction::SurfaceInsight],
        2 => &[ClaimAction::SurfaceInsight],
        3 => &[ClaimAction::SurfaceInsight, ClaimAction::SuggestAction],
        4 => &[
            ClaimAction::SurfaceInsight,
            ClaimAction::SuggestAction,
            ClaimAction::RecommendExperiment,
        ],
        _ => &[
            ClaimAction::SurfaceInsight,
            ClaimAction::SuggestAction,
            ClaimAction::RecommendExperiment,
            ClaimAction::EscalateToClinician,
        ],
    }
}

pub fn is_action_allowed(level: u8, action: ClaimAction) -> bool {
    level_allowed_actions(level).contains(&action)
}

/// Steps one grade down towards D; D stays D. Shared by every governed
/// surface that retries a failed validation one grade at a time before
/// dropping the segment (spec.md §4.8 step 4, §4.13 step 3).
pub fn downgrade_grade(grade: EvidenceGrade) -> EvidenceGrade {
    match grade {
        EvidenceGrade::A => EvidenceGrade::B,
        EvidenceGrade::B => EvidenceGrade::C,
        EvidenceGrade::C | EvidenceGrade::D => EvidenceGrade::D,
    }
}

/// Grade derivation: spec.md §4.1 thresholds (A requires confidence>=0.8 ∧
/// n>=30 ∧ coverage>=0.7 ∧ (|d|>=0.5 ∨ p<0.01); B/C/D progressively weaker).
pub fn get_evidence_grade(
    confidence: f64,
    sample_size: usize,
    coverage: f64,
    effect_size: Option<f64>,
    p_value: Option<f64>,
) -> EvidenceGrade {
    if confidence >= 0.8 && sample_size >= 30 && coverage >= 0.7 {
        let strong_effect = effect_size.map(|d| d.abs() >= 0.5).unwrap_or(false);
        let strong_p = p_value.map(|p| p < 0.01).unwrap_or(false);
        if strong_effect || strong_p {
            return EvidenceGrade::A;
        }
    }
    if confidence >= 0.6 && sample_size >= 14 && coverage >= 0.5 {
        return EvidenceGrade::B;
    }
    if confidence >= 0.4 && sample_size >= 7 && coverage >= 0.3 {
        return EvidenceGrade::C;
    }
    EvidenceGrade::D
}

const UNCERTAINTY_KEYWORDS: &[&str] = &[
    "uncertain", "unclear", "may", "might", "could", "possibly", "potentially", "suggests",
];

/// Validate that `text` adheres to the claim policy for `grade`. Returns
/// (is_valid, violations).
pub fn validate(text: &str, grade: EvidenceGrade) -> (bool, Vec<String>) {
    let policy = policy_for(grade);
    let text_lower = text.to_lowercase();
    let mut violations = Vec::new();

    for verb in policy.disallowed_verbs {
        if text_lower.contains(verb) {
            violations.push(format!(
                "disallowed verb '{verb}' found (grade {:?})",
                policy.grade
            ));
        }
    }

    if policy.uncertainty_required {
        let has_uncertainty = UNCERTAINTY_KEYWORDS.iter().any(|kw| text_lower.contains(kw));
        if !has_uncertainty {
            violations.push(format!("uncertainty must be mentioned for grade {:?}", policy.grade));
        }
    }

    let has_allowed_verb = policy.allowed_verbs.iter().any(|v| text_lower.contains(v));
    if !has_allowed_verb && !policy.allowed_verbs.is_empty() {
        violations.push(format!("no allowed verbs found for grade {:?}", policy.grade));
    }

    (violations.is_empty(), violations)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseDirection {
    Positive,
    Negative,
    Neutral,
}

/// Deterministic, policy-compliant safe phrase for `metric` given `grade`
/// and `direction` (spec.md §4.1 `suggest`).
pub fn suggest(grade: EvidenceGrade, metric: &str, direction: PhraseDirection) -> String {
    let policy = policy_for(grade);
    let verb = match direction {
        PhraseDirection::Positive => match grade {
            EvidenceGrade::A => "improves",
            EvidenceGrade::B => "appears to improve",
            _ => "might improve",
        },
        PhraseDirection::Negative => match grade {
            EvidenceGrade::A => "decreases",
            EvidenceGrade::B => "appears to decrease",
            _ => "might decrease",
        },
        PhraseDirection::Neutral => match grade {
            EvidenceGrade::A | EvidenceGrade::B => "is associated with",
            _ => "might be associated with",
        },
    };

    if policy.uncertainty_required && matches!(grade, EvidenceGrade::C | EvidenceGrade::D) {
        format!("{verb} {metric} (uncertain)")
    } else {
        format!("{verb} {metric}")
    }
}

/// allowed actions lookup surfaced as a map for callers that need the full
/// table (e.g. narrative synthesis action filtering).
pub fn allowed_actions_by_level() -> BTreeMap<u8, Vec<ClaimAction>> {
    (1..=5u8)
        .map(|l| (l, level_allowed_actions(l).to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_a_boundary_exact() {
        let grade = get_evidence_grade(0.8, 30, 0.7, Some(0.5), None);
        assert_eq!(grade, EvidenceGrade::A);
    }

    #[test]
    fn grade_a_requires_effect_or_p() {
        let grade = get_evidence_grade(0.8, 30, 0.7, None, None);
        assert_eq!(grade, EvidenceGrade::B);
    }

    #[test]
    fn grade_falls_to_d_by_default() {
        let grade = get_evidence_grade(0.1, 2, 0.1, None, None);
        assert_eq!(grade, EvidenceGrade::D);
    }

    #[test]
    fn grade_a_text_rejects_causal_verb() {
        let (ok, violations) = validate("This intervention causes better sleep", EvidenceGrade::A);
        assert!(!ok);
        assert!(violations.iter().any(|v| v.contains("causes")));
    }

    #[test]
    fn grade_a_text_with_allowed_verb_passes() {
        let (ok, violations) = validate("Magnesium significantly improves sleep quality", EvidenceGrade::A);
        assert!(ok, "{violations:?}");
    }

    #[test]
    fn grade_c_requires_uncertainty_marker() {
        let (ok, violations) = validate("Magnesium helps sleep", EvidenceGrade::C);
        assert!(!ok);
        assert!(violations.iter().any(|v| v.contains("uncertainty")));
    }

    #[test]
    fn claim_level_mapping_floor_plus_one() {
        assert_eq!(claim_level_from_confidence(0.0), 1);
        assert_eq!(claim_level_from_confidence(0.2), 2);
        assert_eq!(claim_level_from_confidence(0.99), 5);
        assert_eq!(claim_level_from_confidence(1.0), 5);
    }

    #[test]
    fn level_one_cannot_recommend_experiment() {
        assert!(!is_action_allowed(1, ClaimAction::RecommendExperiment));
        assert!(is_action_allowed(4, ClaimAction::RecommendExperiment));
    }

    #[test]
    fn suggest_grade_d_always_flags_uncertain() {
        let phrase = suggest(EvidenceGrade::D, "sleep_duration", PhraseDirection::Positive);
        assert!(phrase.contains("uncertain"));
    }
}
