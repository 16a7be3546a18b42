//! C12: Suppression Service.
//!
//! End-of-loop fatigue control: repeat suppression within a cooldown
//! window, and a daily cap that trims the lowest-confidence surplus.
//! Grounded on
//! `original_source/backend/app/engine/governance/insight_suppression.py`.

use crate::models::Insight;
use chrono::{DateTime, Duration, Utc};

pub const MIN_DAYS_BETWEEN_REPEATS: i64 = 7;
pub const MIN_CONFIDENCE_FOR_REPEAT: f64 = 0.7;
pub const MAX_DAILY_INSIGHTS: usize = 10;

/// Applied per new candidate insight before today's batch is finalized.
/// `prior_insights` should already be restricted to the same user.
pub fn is_repeat_suppressed(
    candidate_metric_key: &str,
    candidate_confidence: f64,
    now: DateTime<Utc>,
    prior_insights: &[Insight],
) -> bool {
    if candidate_confidence >= MIN_CONFIDENCE_FOR_REPEAT {
        return false;
    }
    let window_start = now - Duration::days(MIN_DAYS_BETWEEN_REPEATS);
    prior_insights.iter().any(|i| {
        i.metric_key == candidate_metric_key
            && i.generated_at >= window_start
            && i.generated_at <= now
            && !i.suppressed
    })
}

/// Applies the daily cap across one run's freshly-generated insights,
/// suppressing the lowest-confidence surplus beyond `MAX_DAILY_INSIGHTS`
/// (ties broken by generation order). Insights with confidence >= 0.6 are
/// never suppressed by the cap alone.
pub fn apply_daily_cap(mut insights: Vec<Insight>, already_surfaced_today: usize) -> Vec<Insight> {
    let remaining_capacity = MAX_DAILY_INSIGHTS.saturating_sub(already_surfaced_today);
    if insights.len() <= remaining_capacity {
        return insights;
    }

    let mut indices: Vec<usize> = (0..insights.len()).collect();
    indices.sort_by(|&a, &b| {
        insights[a]
            .confidence
            .partial_cmp(&insights[b].confidence)
            .unwrap()
    });

    let overflow = insights.len() - remaining_capacity;
    let mut suppressed_count = 0;
    for &idx in &indices {
        if suppressed_count >= overflow {
            break;
        }
        if insights[idx].confidence < 0.6 {
            insights[idx].suppressed = true;
            insights[idx].suppression_reason = Some("daily_cap_exceeded".to_string());
            suppressed_count += 1;
        }
    }

    insights
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn insight(metric: &str, confidence: f64, generated_at: DateTime<Utc>) -> Insight {
        Insight {
            id: Uuid::new_v4(),
            user: "u1".to_string(),
            insight_type: crate::models::InsightType::Change,
            metric_key: metric.to_string(),
            domain_key: "sleep".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            confidence,
            claim_level: 2,
            evidence: json!({}),
            generated_at,
            suppressed: false,
            suppression_reason: None,
            policy_sanitized: false,
        }
    }

    #[test]
    fn repeat_within_window_low_confidence_is_suppressed() {
        let now = Utc::now();
        let prior = vec![insight("sleep_duration", 0.5, now - Duration::days(3))];
        assert!(is_repeat_suppressed("sleep_duration", 0.5, now, &prior));
    }

    #[test]
    fn repeat_with_high_confidence_is_not_suppressed() {
        let now = Utc::now();
        let prior = vec![insight("sleep_duration", 0.5, now - Duration::days(3))];
        assert!(!is_repeat_suppressed("sleep_duration", 0.9, now, &prior));
    }

    #[test]
    fn repeat_outside_window_is_not_suppressed() {
        let now = Utc::now();
        let prior = vec![insight("sleep_duration", 0.5, now - Duration::days(10))];
        assert!(!is_repeat_suppressed("sleep_duration", 0.5, now, &prior));
    }

    #[test]
    fn daily_cap_suppresses_lowest_confidence_first() {
        let now = Utc::now();
        let insights: Vec<Insight> = (0..3)
            .map(|i| insight("m", 0.3 + i as f64 * 0.05, now))
            .collect();
        let result = apply_daily_cap(insights, MAX_DAILY_INSIGHTS - 1);
        let suppressed = result.iter().filter(|i| i.suppressed).count();
        assert_eq!(suppressed, 2);
        assert!(result[0].suppressed);
    }

    #[test]
    fn within_capacity_nothing_suppressed() {
        let now = Utc::now();
        let insights: Vec<Insight> = (0..3).map(|_| insight("m", 0.9, now)).collect();
        let result = apply_daily_cap(insights, 0);
        assert!(result.iter().all(|i| !i.suppressed));
    }
}
