//! Daily aggregation helpers shared by Detectors (C8), Attribution (C13),
//! and Evaluation (C14). Grounded on
//! `original_source/backend/app/engine/analytics/time_series.py`
//! (`_aggregate_by_day` / `merge_daily_series`).

use crate::models::HealthDataPoint;
use crate::registry::Aggregation;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyValue {
    pub date: NaiveDate,
    pub value: f64,
    pub count: usize,
}

/// Aggregate points (assumed pre-filtered to one user/metric) into one
/// value per UTC calendar day, sorted ascending by date.
pub fn aggregate_by_day(points: &[HealthDataPoint], aggregation: Aggregation) -> Vec<DailyValue> {
    let mut buckets: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for p in points {
        buckets.entry(p.timestamp.date_naive()).or_default().push(p.value);
    }

    buckets
        .into_iter()
        .map(|(date, values)| {
            let value = match aggregation {
                Aggregation::Sum => values.iter().sum(),
                Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
            };
            DailyValue {
                date,
                value,
                count: values.len(),
            }
        })
        .collect()
}

/// Points for `user`/`metric_key` within `[start, end)`, as a daily series.
pub fn daily_series_in_window(
    points: &[HealthDataPoint],
    user: &str,
    metric_key: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    aggregation: Aggregation,
) -> Vec<DailyValue> {
    let filtered: Vec<HealthDataPoint> = points
        .iter()
        .filter(|p| {
            p.user == user && p.metric_key == metric_key && p.timestamp >= start && p.timestamp < end
        })
        .cloned()
        .collect();
    aggregate_by_day(&filtered, aggregation)
}

/// Most recent point timestamp for `user`/`metric_key`, if any.
pub fn latest_timestamp(points: &[HealthDataPoint], user: &str, metric_key: &str) -> Option<DateTime<Utc>> {
    points
        .iter()
        .filter(|p| p.user == user && p.metric_key == metric_key)
        .map(|p| p.timestamp)
        .max()
}

/// Linear interpolation over missing calendar days between the first and
/// last entries of `series` (spec.md §4.10 step 3: "interpolate missing
/// outcomes between nearest neighbors"). Days with no neighbors on either
/// side are left absent.
pub fn interpolate_daily(series: &[DailyValue]) -> BTreeMap<NaiveDate, f64> {
    let mut out: BTreeMap<NaiveDate, f64> = series.iter().map(|d| (d.date, d.value)).collect();
    if series.len() < 2 {
        return out;
    }
    let start = series.first().unwrap().date;
    let end = series.last().unwrap().date;
    let mut cursor = start;
    while cursor <= end {
        if !out.contains_key(&cursor) {
            // find surrounding known days
            let before = out.range(..cursor).next_back().map(|(d, v)| (*d, *v));
            let after = out.range(cursor..).next().map(|(d, v)| (*d, *v));
            if let (Some((d0, v0)), Some((d1, v1))) = (before, after) {
                let span = (d1 - d0).num_days() as f64;
                let pos = (cursor - d0).num_days() as f64;
                if span > 0.0 {
                    out.insert(cursor, v0 + (v1 - v0) * (pos / span));
                }
            }
        }
        cursor += chrono::Duration::days(1);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn point(metric: &str, value: f64, ts: DateTime<Utc>) -> HealthDataPoint {
        HealthDataPoint {
            id: Uuid::new_v4(),
            user: "u1".into(),
            metric_key: metric.into(),
            value,
            unit: "minutes".into(),
            timestamp: ts,
            source: "whoop".into(),
            provenance_id: Uuid::new_v4(),
            quality_score: 1.0,
            flagged: false,
        }
    }

    #[test]
    fn aggregates_same_day_points() {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        let points = vec![
            point("sleep_duration", 400.0, base),
            point("sleep_duration", 420.0, base + chrono::Duration::hours(1)),
        ];
        let daily = aggregate_by_day(&points, Aggregation::Mean);
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].value, 410.0);
        assert_eq!(daily[0].count, 2);
    }

    #[test]
    fn interpolation_fills_gap() {
        let series = vec![
            DailyValue { date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), value: 0.0, count: 1 },
            DailyValue { date: NaiveDate::from_ymd_opt(2026, 1, 3).unwrap(), value: 10.0, count: 1 },
        ];
        let interp = interpolate_daily(&series);
        assert_eq!(interp[&NaiveDate::from_ymd_opt(2026, 1, 2).unwrap()], 5.0);
    }
}
