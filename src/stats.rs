//! Deterministic statistics helpers shared by Detectors (C8), Attribution
//! (C13), and Evaluation (C14). Grounded on
//! `original_source/backend/app/engine/analytics/{time_series,rolling_metrics,correlation}.py`.
//!
//! Everything here is a pure function over `&[f64]` — no I/O, no randomness.

use statrs::distribution::{ContinuousCDF, StudentsT};

/// Arithmetic mean. Returns 0.0 for an empty slice (callers gate on length).
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (matches Python's `statistics.pstdev`,
/// used throughout the original baseline/detector code).
pub fn pstdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mu = mean(values);
    let variance = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Sample standard deviation (n-1 denominator), used for evaluation-window
/// statistics where each window is a sample, not the full population.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mu = mean(values);
    let variance = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Ordinary least squares slope of `values` against their index (0..n),
/// i.e. per-unit-time slope when values are consecutive daily aggregates.
pub fn ols_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let x_mean = mean(&xs);
    let y_mean = mean(values);
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..n {
        num += (xs[i] - x_mean) * (values[i] - y_mean);
        den += (xs[i] - x_mean).powi(2);
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Simple linear regression y = alpha + beta*x, returning (alpha, beta, r_squared).
pub fn linreg(xs: &[f64], ys: &[f64]) -> (f64, f64, f64) {
    let n = xs.len();
    if n < 2 || n != ys.len() {
        return (0.0, 0.0, 0.0);
    }
    let x_mean = mean(xs);
    let y_mean = mean(ys);
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for i in 0..n {
        let dx = xs[i] - x_mean;
        let dy = ys[i] - y_mean;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx == 0.0 {
        return (y_mean, 0.0, 0.0);
    }
    let beta = sxy / sxx;
    let alpha = y_mean - beta * x_mean;
    let r_squared = if syy == 0.0 { 0.0 } else { (sxy * sxy) / (sxx * syy) };
    (alpha, beta, r_squared)
}

/// Cohen's d with pooled standard deviation between two independent samples.
pub fn cohens_d(a: &[f64], b: &[f64]) -> f64 {
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }
    let sa = sample_std(a);
    let sb = sample_std(b);
    let na = a.len() as f64;
    let nb = b.len() as f64;
    let pooled = (((na - 1.0) * sa.powi(2) + (nb - 1.0) * sb.powi(2)) / (na + nb - 2.0)).sqrt();
    if pooled == 0.0 {
        return 0.0;
    }
    (mean(a) - mean(b)) / pooled
}

/// 95% two-sided critical value for the t-distribution at `df` degrees of
/// freedom, or the normal-approximation z=1.96 for df>=30 (spec.md §4.11).
pub fn t_critical_95(df: f64) -> f64 {
    if df < 1.0 {
        return 1.96;
    }
    if df >= 30.0 {
        return 1.96;
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => dist.inverse_cdf(0.975),
        Err(_) => 1.96,
    }
}

/// 95% confidence interval for a sample mean given its standard deviation
/// and sample size.
pub fn confidence_interval_95(mean_val: f64, std: f64, n: usize) -> (f64, f64) {
    if n < 2 {
        return (mean_val, mean_val);
    }
    let se = std / (n as f64).sqrt();
    let tcrit = t_critical_95((n - 1) as f64);
    (mean_val - tcrit * se, mean_val + tcrit * se)
}

/// Approximate p-value from R^2 via an ad hoc piecewise F-statistic mapping.
/// Open Question in spec.md §9 resolved in favor of this approximation
/// (matches `original_source/backend/app/engine/attribution/guardrails.py`
/// `compute_p_value_from_r_squared`) rather than a full F-distribution CDF,
/// to keep behavior bit-identical to the system this spec was distilled from.
pub fn p_value_from_r_squared(r_squared: f64, n: usize) -> f64 {
    if n < 3 || r_squared <= 0.0 || r_squared >= 1.0 {
        return 1.0;
    }
    let f_stat = (r_squared / 1.0) / ((1.0 - r_squared) / (n as f64 - 2.0));
    if f_stat < 1.0 {
        0.5
    } else if f_stat < 4.0 {
        0.1
    } else if f_stat < 10.0 {
        0.01
    } else {
        0.001
    }
}

/// Benjamini-Hochberg FDR correction. `p_values` need not be pre-sorted;
/// the returned `Vec<bool>` is aligned to the input order.
pub fn benjamini_hochberg(p_values: &[f64], alpha: f64) -> Vec<bool> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }
    let mut indexed: Vec<(usize, f64)> = p_values.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

    let mut results = vec![false; m];
    for k in (0..m).rev() {
        let (_, p_val) = indexed[k];
        let threshold = ((k + 1) as f64 / m as f64) * alpha;
        if p_val <= threshold {
            for item in indexed.iter().take(k + 1) {
                results[item.0] = true;
            }
            break;
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_pstdev_known_values() {
        let v = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&v) - 5.0).abs() < 1e-9);
        assert!((pstdev(&v) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn ols_slope_positive_trend() {
        let v = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((ols_slope(&v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ols_slope_flat() {
        let v = vec![3.0, 3.0, 3.0, 3.0];
        assert!(ols_slope(&v).abs() < 1e-9);
    }

    #[test]
    fn cohens_d_identical_samples_is_zero() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![1.0, 2.0, 3.0, 4.0];
        assert!(cohens_d(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn cohens_d_large_shift_is_large() {
        let a = vec![10.0, 11.0, 9.0, 10.0, 10.0];
        let b = vec![1.0, 2.0, 0.0, 1.0, 1.0];
        assert!(cohens_d(&a, &b) > 2.0);
    }

    #[test]
    fn t_critical_converges_to_z_for_large_df() {
        assert!((t_critical_95(100.0) - 1.96).abs() < 1e-9);
        assert!((t_critical_95(30.0) - 1.96).abs() < 1e-9);
    }

    #[test]
    fn t_critical_small_df_wider_than_z() {
        assert!(t_critical_95(5.0) > 1.96);
    }

    #[test]
    fn bh_fdr_passes_strong_signal() {
        let p = vec![0.001, 0.2, 0.3, 0.8];
        let result = benjamini_hochberg(&p, 0.05);
        assert!(result[0]);
    }

    #[test]
    fn p_value_from_r_squared_boundaries() {
        assert_eq!(p_value_from_r_squared(0.0, 10), 1.0);
        assert_eq!(p_value_from_r_squared(0.5, 2), 1.0);
    }
}
