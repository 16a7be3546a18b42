//! C2: Health Domain Map.
//!
//! Static, pure membership mapping of metric -> domain, plus the domain
//! registry itself. Grounded on `original_source/backend/app/domain/health_domains.py`
//! (trimmed to the membership table; the source's long domain-specific
//! narrative copy is out of this crate's scope).

use std::collections::BTreeMap;

lazy_static::lazy_static! {
    static ref DOMAIN_LABELS: BTreeMap<&'static str, &'static str> = {
        let mut m = BTreeMap::new();
        m.insert("sleep", "Sleep");
        m.insert("cardiometabolic", "Cardiometabolic");
        m.insert("stress_nervous_system", "Stress & Nervous System");
        m.insert("activity", "Activity");
        m.insert("energy_fatigue", "Energy & Fatigue");
        m
    };
}

pub fn domain_label(domain_key: &str) -> &'static str {
    DOMAIN_LABELS.get(domain_key).copied().unwrap_or("Other")
}

/// Domain for a metric, delegating to the Metric Registry (C1) as the single
/// source of truth for membership (spec.md C2 "pure metadata").
pub fn domain_for_metric(metric_key: &str) -> Option<&'static str> {
    crate::registry::get_metric_spec(metric_key)
        .ok()
        .map(|spec| spec.domain)
}

pub fn all_domains() -> Vec<&'static str> {
    DOMAIN_LABELS.keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_duration_maps_to_sleep() {
        assert_eq!(domain_for_metric("sleep_duration"), Some("sleep"));
    }

    #[test]
    fn unknown_metric_has_no_domain() {
        assert_eq!(domain_for_metric("not_a_metric"), None);
    }

    #[test]
    fn domain_label_falls_back() {
        assert_eq!(domain_label("nonexistent_domain"), "Other");
        assert_eq!(domain_label("sleep"), "Sleep");
    }
}
