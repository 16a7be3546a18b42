//! C16: Narrative Synthesis, plus Domain Status (C2 companion) classification.
//!
//! Assembles a daily/weekly narrative from insights, evaluations,
//! check-ins, and personal drivers — every sentence that asserts a
//! relationship is phrased through [`crate::claim_policy`] at the
//! confidence-derived claim level, so a low-confidence driver can never
//! read as a confident claim. When there's nothing to say, the narrative
//! says so plainly rather than manufacturing a key point. Grounded on
//! `original_source/backend/app/engine/synthesis/narrative_synthesizer.py`
//! and `original_source/backend/app/engine/domain_status.py`.

use crate::claim_policy::{self, ClaimAction, EvidenceGrade, PhraseDirection};
use crate::domains;
use crate::models::{
    AdherenceEvent, Baseline, DailyCheckIn, DomainStatus, Direction, EvaluationResult, Insight, InsightType,
    KeyPoint, Narrative, NarrativeAction, NarrativeMetadata, NarrativeRisk, PeriodType, PersonalDriver,
};
use crate::registry;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

const MIN_DRIVER_CONFIDENCE: f64 = 0.6;
const LOW_COVERAGE_THRESHOLD: f64 = 0.5;
const MAX_DRIVERS: usize = 25;
const MAX_ACTIONS: usize = 10;
const MAX_RISKS: usize = 10;

// ============================================
// Domain status (conservative silence classification)
// ============================================

/// Signals (metrics) belonging to `domain_key`, per the metric registry.
fn signals_for_domain(domain_key: &str) -> Vec<&'static str> {
    registry::list_metrics()
        .into_iter()
        .filter(|m| domains::domain_for_metric(m) == Some(domain_key))
        .collect()
}

/// Ordered, conservative status for one domain: no data -> baseline
/// building -> no signal detected -> signal detected. Never infers beyond
/// what data/baselines/surfaced insights already establish.
pub fn compute_domain_status(
    domain_key: &str,
    points_present_metrics: &[String],
    baselines: &[Baseline],
    surfaced_insight_domains: &std::collections::BTreeSet<String>,
) -> DomainStatus {
    let signals = signals_for_domain(domain_key);
    let present: std::collections::BTreeSet<&str> = points_present_metrics
        .iter()
        .map(|s| s.as_str())
        .filter(|m| signals.contains(m))
        .collect();

    if present.is_empty() {
        return DomainStatus::NoData;
    }

    let baseline_metrics: std::collections::BTreeSet<&str> =
        baselines.iter().map(|b| b.metric_key.as_str()).collect();
    let missing_baseline = present.iter().any(|m| !baseline_metrics.contains(m));
    if missing_baseline {
        return DomainStatus::BaselineBuilding;
    }

    if !surfaced_insight_domains.contains(domain_key) {
        return DomainStatus::NoSignalDetected;
    }

    DomainStatus::SignalDetected
}

pub fn compute_domain_statuses(
    points_present_metrics: &[String],
    baselines: &[Baseline],
    surfaced_insights: &[Insight],
) -> BTreeMap<String, DomainStatus> {
    let surfaced_domains: std::collections::BTreeSet<String> =
        surfaced_insights.iter().filter(|i| !i.suppressed).map(|i| i.domain_key.clone()).collect();

    domains::all_domains()
        .into_iter()
        .map(|dk| (dk.to_string(), compute_domain_status(dk, points_present_metrics, baselines, &surfaced_domains)))
        .collect()
}

// ============================================
// Narrative synthesis
// ============================================

fn direction_for(direction: Direction) -> PhraseDirection {
    match direction {
        Direction::Positive => PhraseDirection::Positive,
        Direction::Negative => PhraseDirection::Negative,
        Direction::Neutral | Direction::Mixed => PhraseDirection::Neutral,
    }
}

/// Policy-validated phrasing for one narrative segment, mirroring the loop
/// runner's pipeline (spec.md §4.13 step 3): pick the grade the segment's
/// numbers actually support, ask Claim Policy for a compliant phrase,
/// validate it, and on failure step down one grade at a time. A segment
/// that still fails to validate at grade D is fail-closed — dropped rather
/// than surfaced unsanitized. Returns `(phrase, claim_level)`.
fn validated_segment_phrase(
    confidence: f64,
    sample_size: usize,
    coverage: f64,
    effect_size: f64,
    metric: &str,
    direction: PhraseDirection,
) -> Option<(String, u8)> {
    let grade = claim_policy::get_evidence_grade(confidence, sample_size, coverage, Some(effect_size), None);
    let mut effective_grade = grade;
    let mut phrase = claim_policy::suggest(effective_grade, metric, direction);
    let mut valid = claim_policy::validate(&phrase, effective_grade).0;
    let mut downgraded = false;
    while !valid && effective_grade != EvidenceGrade::D {
        effective_grade = claim_policy::downgrade_grade(effective_grade);
        phrase = claim_policy::suggest(effective_grade, metric, direction);
        valid = claim_policy::validate(&phrase, effective_grade).0;
        downgraded = true;
    }
    if !valid {
        return None;
    }
    let mut claim_level = claim_policy::claim_level_from_confidence(confidence);
    if downgraded {
        claim_level = claim_level.saturating_sub(1).max(1);
    }
    Some((phrase, claim_level))
}

/// Drivers that clear the confidence bar, each re-synthesized through
/// Claim Policy rather than a fixed phrase table, so a driver whose
/// numbers don't support the derived grade is downgraded or dropped, never
/// surfaced as an overclaim.
fn driver_key_points(personal_drivers: &[PersonalDriver]) -> Vec<(PersonalDriver, String, u8)> {
    let mut out = Vec::new();
    for pd in personal_drivers.iter().filter(|d| d.confidence >= MIN_DRIVER_CONFIDENCE).take(10) {
        let lag_text = if pd.lag_days > 0 { format!(" (with {}-day lag)", pd.lag_days) } else { String::new() };
        let metric_label = format!("{} via {}{}", pd.outcome_metric.replace('_', " "), pd.driver_key.replace('_', " "), lag_text);
        let direction = direction_for(pd.direction);
        if let Some((phrase, claim_level)) =
            validated_segment_phrase(pd.confidence, pd.sample_size, pd.variance_explained.min(1.0), pd.effect_size, &metric_label, direction)
        {
            out.push((pd.clone(), phrase, claim_level));
        }
        // else: fail-closed, spec.md §4.13 step 3 — the driver is dropped
        // from this narrative rather than surfaced with unvalidated language.
    }
    out
}

/// Assembles a narrative draft for `[period_start, period_end]` from the
/// raw rows the caller already fetched for that user. Pure and
/// deterministic: same inputs always produce the same narrative.
#[allow(clippy::too_many_arguments)]
pub fn synthesize_narrative(
    user: &str,
    period_type: PeriodType,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    insights: &[Insight],
    evaluations: &[EvaluationResult],
    checkins: &[DailyCheckIn],
    adherence_events: &[AdherenceEvent],
    personal_drivers: &[PersonalDriver],
    points_present_metrics: &[String],
    baselines: &[Baseline],
) -> Narrative {
    let in_range: Vec<&Insight> = insights
        .iter()
        .filter(|i| i.generated_at >= period_start && i.generated_at <= period_end && i.insight_type != InsightType::InsufficientData)
        .collect();
    let eval_in_range: Vec<&EvaluationResult> =
        evaluations.iter().filter(|e| e.created_at >= period_start && e.created_at <= period_end).collect();

    let window_days = (period_end.date_naive() - period_start.date_naive()).num_days() + 1;
    let expected_days = window_days.max(1) as f64;
    let coverage = (checkins.len() as f64 / expected_days).min(1.0);

    let mut risks = Vec::new();
    let mut key_points = Vec::new();

    for pd_entry in driver_key_points(personal_drivers) {
        let (pd, text, _claim_level) = pd_entry;
        key_points.push(KeyPoint {
            text: format!("{}: {}", pd.outcome_metric, text),
            metric_key: pd.outcome_metric.clone(),
            domain_key: domains::domain_for_metric(&pd.outcome_metric).unwrap_or("").to_string(),
        });
    }

    for insight in in_range.iter().take(50 - key_points.len().min(50)) {
        if insight.insight_type == InsightType::Safety {
            let risk_level = insight.evidence.get("risk_level").and_then(|v| v.as_str()).unwrap_or("");
            if risk_level == "high" || risk_level == "moderate" {
                risks.push(NarrativeRisk {
                    text: insight
                        .evidence
                        .get("headline")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&insight.title)
                        .to_string(),
                    severity: risk_level.to_string(),
                    metric_key: Some(insight.metric_key.clone()),
                });
            }
        }
        key_points.push(KeyPoint {
            text: format!("{}: {}", insight.metric_key, insight.title),
            metric_key: insight.metric_key.clone(),
            domain_key: insight.domain_key.clone(),
        });
    }

    if key_points.is_empty() {
        key_points.push(KeyPoint {
            text: "No notable changes detected in this period.".to_string(),
            metric_key: String::new(),
            domain_key: String::new(),
        });
    }

    let mut actions = Vec::new();
    for ev in eval_in_range.iter().take(10) {
        if ev.verdict == crate::models::Verdict::Helpful {
            // Helpful verdicts assert an effect, so the rationale goes
            // through the same validate/downgrade/drop pipeline as a
            // driver phrase (spec.md §4.13 step 3) rather than a fixed
            // "suggests this protocol may be helpful" string.
            let sample_size = ev.baseline.n.min(ev.intervention.n);
            let coverage_e = ev.baseline.coverage.min(ev.intervention.coverage);
            let direction = if ev.delta >= 0.0 { PhraseDirection::Positive } else { PhraseDirection::Negative };
            let metric_label = ev.metric_key.replace('_', " ");
            if let Some((phrase, claim_level)) =
                validated_segment_phrase(ev.confidence_score, sample_size, coverage_e, ev.effect_size_d, &metric_label, direction)
            {
                let action_text = if claim_policy::is_action_allowed(claim_level, ClaimAction::SuggestAction) {
                    "Consider continuing"
                } else {
                    "Monitor"
                };
                actions.push(NarrativeAction {
                    action: action_text.to_string(),
                    rationale: format!("Experiment data {phrase}"),
                    metric_key: ev.metric_key.clone(),
                    claim_level,
                });
            }
            // else: fail-closed, no validated language to support an
            // action on this evaluation — it is silently dropped.
        } else {
            // Not an effect claim, just pointing at the experiment's
            // status, so no grade/verb validation applies.
            let claim_level = claim_policy::claim_level_from_confidence(ev.confidence_score);
            actions.push(NarrativeAction {
                action: "Review".to_string(),
                rationale: format!("Experiment verdict: {:?}", ev.verdict),
                metric_key: ev.metric_key.clone(),
                claim_level,
            });
        }
    }

    if coverage < LOW_COVERAGE_THRESHOLD {
        actions.push(NarrativeAction {
            action: "Complete daily check-ins".to_string(),
            rationale: "Subjective signals help explain wearable/lab changes and make evaluations more reliable.".to_string(),
            metric_key: String::new(),
            claim_level: 1,
        });
    }

    let title = match period_type {
        PeriodType::Daily => format!("Daily summary — {}", period_start.date_naive()),
        PeriodType::Weekly => format!("Weekly summary — {} to {}", period_start.date_naive(), period_end.date_naive()),
    };
    let mut summary = format!(
        "{} insights generated. {} experiment evaluations. Check-in coverage: {}%.",
        in_range.len(),
        eval_in_range.len(),
        (coverage * 100.0) as i64
    );
    // Invariant (spec.md §8): a surfaced high/moderate risk must always be
    // reflected in the summary or key points — never silently dropped.
    // Risks are only ever pushed above for high/moderate severity insights,
    // so appending this note whenever `risks` is non-empty satisfies the
    // invariant by construction rather than validating after the fact.
    if !risks.is_empty() {
        summary.push_str(" Potential risk(s) detected this period — review recommended.");
    }

    let domain_statuses = compute_domain_statuses(points_present_metrics, baselines, insights);
    let mut counts = BTreeMap::new();
    counts.insert("insights".to_string(), in_range.len());
    counts.insert("evaluations".to_string(), eval_in_range.len());
    counts.insert("checkins".to_string(), checkins.len());
    counts.insert("adherence_events".to_string(), adherence_events.len());

    key_points.truncate(52);
    Narrative {
        id: Uuid::new_v4(),
        user: user.to_string(),
        period_type,
        period_start,
        period_end,
        title,
        summary,
        key_points,
        drivers: personal_drivers.iter().take(MAX_DRIVERS).map(|d| d.driver_key.clone()).collect(),
        actions: { actions.truncate(MAX_ACTIONS); actions },
        risks: { risks.truncate(MAX_RISKS); risks },
        metadata: NarrativeMetadata { domain_statuses, coverage, counts },
    }
}

/// A neutral sentence for a metric/direction pair that doesn't clear the
/// bar for any personal-driver or insight segment above — used when a
/// caller wants a safe one-liner without running full synthesis.
pub fn safe_phrase(grade: crate::models::EvidenceGrade, metric: &str, direction: PhraseDirection) -> String {
    claim_policy::suggest(grade, metric, direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn driver(confidence: f64, direction: Direction) -> PersonalDriver {
        PersonalDriver {
            id: Uuid::new_v4(),
            user: "u1".to_string(),
            driver_key: "melatonin".to_string(),
            driver_type: "intervention".to_string(),
            outcome_metric: "sleep_duration".to_string(),
            lag_days: 1,
            effect_size: 0.6,
            direction,
            variance_explained: 0.3,
            confidence,
            stability: 0.8,
            sample_size: 20,
            window_start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            window_end: Utc.with_ymd_and_hms(2026, 1, 28, 0, 0, 0).unwrap(),
            label: None,
        }
    }

    #[test]
    fn empty_period_says_no_notable_changes() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 1, 23, 59, 59).unwrap();
        let narrative = synthesize_narrative("u1", PeriodType::Daily, start, end, &[], &[], &[], &[], &[], &[], &[]);
        assert_eq!(narrative.key_points[0].text, "No notable changes detected in this period.");
    }

    #[test]
    fn low_confidence_driver_is_excluded() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 1, 23, 59, 59).unwrap();
        let drivers = vec![driver(0.4, Direction::Positive)];
        let narrative = synthesize_narrative("u1", PeriodType::Daily, start, end, &[], &[], &[], &[], &drivers, &[], &[]);
        assert!(narrative.drivers.is_empty());
    }

    #[test]
    fn high_confidence_driver_becomes_key_point_with_validated_phrasing() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 1, 23, 59, 59).unwrap();
        let drivers = vec![driver(0.9, Direction::Positive)];
        let narrative = synthesize_narrative("u1", PeriodType::Daily, start, end, &[], &[], &[], &[], &drivers, &[], &[]);
        assert_eq!(narrative.drivers, vec!["melatonin".to_string()]);
        // The fixture's variance_explained (0.3) keeps it below the B-grade
        // coverage bar, so the validated phrase lands at grade C ("might
        // improve ... (uncertain)") rather than a stronger claim — proof
        // the text actually went through claim-policy validation instead
        // of a fixed phrase table.
        let text = &narrative.key_points[0].text;
        assert!(text.contains("might improve"), "{text}");
        assert!(text.contains("uncertain"), "{text}");
        assert!(claim_policy::validate(text, EvidenceGrade::C).0);
    }

    #[test]
    fn driver_at_b_grade_coverage_still_downgrades_to_a_validated_phrase() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 1, 23, 59, 59).unwrap();
        // Coverage and sample size clear the B-grade bar, but `suggest`'s
        // B-grade phrasing carries no uncertainty marker, so `validate`
        // rejects it and the pipeline downgrades one level to C before
        // persisting — it never surfaces unvalidated B-grade language.
        let mut pd = driver(0.9, Direction::Positive);
        pd.variance_explained = 0.8;
        pd.sample_size = 20;
        let narrative = synthesize_narrative("u1", PeriodType::Daily, start, end, &[], &[], &[], &[], &[pd], &[], &[]);
        let text = &narrative.key_points[0].text;
        assert!(!text.contains("appears to improve"), "{text}");
        assert!(text.contains("might improve"), "{text}");
        assert!(claim_policy::validate(text, EvidenceGrade::C).0);
    }

    #[test]
    fn low_checkin_coverage_prompts_action() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 1, 23, 59, 59).unwrap();
        let narrative = synthesize_narrative("u1", PeriodType::Daily, start, end, &[], &[], &[], &[], &[], &[], &[]);
        assert!(narrative.actions.iter().any(|a| a.action == "Complete daily check-ins"));
    }

    #[test]
    fn surfaced_high_risk_always_appears_in_summary_or_key_points() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 1, 23, 59, 59).unwrap();
        let safety_insight = Insight {
            id: Uuid::new_v4(),
            user: "u1".to_string(),
            insight_type: InsightType::Safety,
            metric_key: "resting_hr".to_string(),
            domain_key: "cardiometabolic".to_string(),
            title: "Safety check: resting_hr_high".to_string(),
            description: "resting heart rate well above normal".to_string(),
            confidence: 1.0,
            claim_level: 1,
            evidence: serde_json::json!({ "risk_level": "high" }),
            generated_at: start,
            suppressed: false,
            suppression_reason: None,
            policy_sanitized: true,
        };
        let narrative = synthesize_narrative("u1", PeriodType::Daily, start, end, &[safety_insight], &[], &[], &[], &[], &[], &[]);
        assert!(!narrative.risks.is_empty());
        let mentions_risk = narrative.summary.to_lowercase().contains("risk")
            || narrative.key_points.iter().any(|kp| kp.text.to_lowercase().contains("risk"));
        assert!(mentions_risk);
    }
}
