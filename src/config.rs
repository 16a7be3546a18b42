//! Runtime configuration.
//!
//! The teacher reads configuration ad hoc — scattered `const`s and the
//! occasional `std::env::var` lookup (e.g. `OLLAMA_BASE_URL`). This crate
//! recognizes many more options than the teacher's handful of consts, so
//! they're centralized here behind one `Config::from_env`, still built on
//! plain `std::env::var` with typed defaults — no third-party config
//! crate, matching the teacher's style (spec.md §6 "Configuration").

use crate::detectors::DetectorThresholds;
use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    Dev,
    Staging,
    Prod,
    Demo,
}

impl EnvMode {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "staging" => EnvMode::Staging,
            "prod" | "production" => EnvMode::Prod,
            "demo" => EnvMode::Demo,
            _ => EnvMode::Dev,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Public,
    Private,
}

impl AuthMode {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "private" => AuthMode::Private,
            _ => AuthMode::Public,
        }
    }
}

/// One metric's threshold overrides, parsed from the
/// `METRIC_THRESHOLD_<KEY>_<KIND>` naming convention (e.g.
/// `METRIC_THRESHOLD_SLEEP_DURATION_Z=2.0`). Any field left unset falls
/// back to `DetectorThresholds::default()` when applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricThresholdOverride {
    pub z_threshold: Option<f64>,
    pub slope_threshold: Option<f64>,
    pub instability_ratio_threshold: Option<f64>,
}

impl MetricThresholdOverride {
    /// Merges this override onto the default thresholds, used by the loop
    /// runner before invoking the detectors for a given metric.
    pub fn resolve(&self) -> DetectorThresholds {
        let defaults = DetectorThresholds::default();
        DetectorThresholds {
            z_threshold: self.z_threshold.unwrap_or(defaults.z_threshold),
            slope_threshold: self.slope_threshold.unwrap_or(defaults.slope_threshold),
            instability_ratio_threshold: self.instability_ratio_threshold.unwrap_or(defaults.instability_ratio_threshold),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub env_mode: EnvMode,
    pub auth_mode: AuthMode,
    pub database_url: String,
    pub enable_llm_translation: bool,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub assessment_days: u32,
    pub max_batch_ingest: usize,
    pub max_daily_insights: usize,
    pub min_days_between_repeats: i64,
    pub baseline_disconnect_hours: i64,
    pub per_user_loop_soft_timeout_ms: u64,
    pub narrative_timeout_ms: u64,
    pub provider_sync_timeout_s: u64,
    pub metric_threshold_overrides: HashMap<String, MetricThresholdOverride>,
}

impl Config {
    /// Reads recognized environment variables, falling back to spec.md
    /// §6's documented defaults for anything unset.
    pub fn from_env() -> Self {
        Config {
            env_mode: env::var("ENV_MODE").map(|v| EnvMode::parse(&v)).unwrap_or(EnvMode::Dev),
            auth_mode: env::var("AUTH_MODE").map(|v| AuthMode::parse(&v)).unwrap_or(AuthMode::Public),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "vitalloop.sqlite3".to_string()),
            enable_llm_translation: env_flag("ENABLE_LLM_TRANSLATION", false),
            ollama_base_url: env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            ollama_model: env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.1".to_string()),
            assessment_days: env_parse("ASSESSMENT_DAYS", 30),
            max_batch_ingest: env_parse("MAX_BATCH_INGEST", 1000),
            max_daily_insights: env_parse("MAX_DAILY_INSIGHTS", 10),
            min_days_between_repeats: env_parse("MIN_DAYS_BETWEEN_REPEATS", 7),
            baseline_disconnect_hours: env_parse("BASELINE_DISCONNECT_HOURS", 48),
            per_user_loop_soft_timeout_ms: env_parse("LOOP_SOFT_TIMEOUT_MS", 5000),
            narrative_timeout_ms: env_parse("NARRATIVE_TIMEOUT_MS", 3000),
            provider_sync_timeout_s: env_parse("PROVIDER_SYNC_TIMEOUT_S", 30),
            metric_threshold_overrides: parse_metric_threshold_overrides(),
        }
    }

    /// Threshold overrides resolved for one metric, falling back to the
    /// detector's built-in defaults when no override was configured.
    pub fn thresholds_for(&self, metric_key: &str) -> DetectorThresholds {
        match self.metric_threshold_overrides.get(metric_key) {
            Some(o) => o.resolve(),
            None => DetectorThresholds::default(),
        }
    }
}

impl Default for Config {
    /// A config with no environment variables set, useful for tests and
    /// for the demo binary when no `.env` is present.
    fn default() -> Self {
        Config {
            env_mode: EnvMode::Dev,
            auth_mode: AuthMode::Public,
            database_url: "vitalloop.sqlite3".to_string(),
            enable_llm_translation: false,
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            ollama_model: "llama3.1".to_string(),
            assessment_days: 30,
            max_batch_ingest: 1000,
            max_daily_insights: 10,
            min_days_between_repeats: 7,
            baseline_disconnect_hours: 48,
            per_user_loop_soft_timeout_ms: 5000,
            narrative_timeout_ms: 3000,
            provider_sync_timeout_s: 30,
            metric_threshold_overrides: HashMap::new(),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Scans the environment for `METRIC_THRESHOLD_<KEY>_<KIND>` variables,
/// where `<KIND>` is one of `Z`, `SLOPE`, `INSTABILITY`, and `<KEY>` is a
/// metric key upper-cased. E.g. `METRIC_THRESHOLD_SLEEP_DURATION_Z=2.0`
/// overrides the z-score threshold for the `sleep_duration` metric.
fn parse_metric_threshold_overrides() -> HashMap<String, MetricThresholdOverride> {
    let mut overrides: HashMap<String, MetricThresholdOverride> = HashMap::new();
    for (name, value) in env::vars() {
        let Some(rest) = name.strip_prefix("METRIC_THRESHOLD_") else { continue };
        let Ok(parsed) = value.parse::<f64>() else { continue };

        let (key_part, kind) = match rest.rsplit_once('_') {
            Some(split) => split,
            None => continue,
        };
        let metric_key = key_part.to_ascii_lowercase();
        let entry = overrides.entry(metric_key).or_default();
        match kind {
            "Z" => entry.z_threshold = Some(parsed),
            "SLOPE" => entry.slope_threshold = Some(parsed),
            "INSTABILITY" => entry.instability_ratio_threshold = Some(parsed),
            _ => {}
        }
    }
    overrides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.assessment_days, 30);
        assert_eq!(cfg.max_batch_ingest, 1000);
        assert_eq!(cfg.max_daily_insights, 10);
        assert_eq!(cfg.min_days_between_repeats, 7);
        assert!(!cfg.enable_llm_translation);
    }

    #[test]
    fn threshold_override_falls_back_to_detector_defaults_when_unset() {
        let cfg = Config::default();
        let resolved = cfg.thresholds_for("sleep_duration");
        let defaults = DetectorThresholds::default();
        assert_eq!(resolved.z_threshold, defaults.z_threshold);
    }

    #[test]
    fn partial_override_merges_onto_defaults() {
        let mut cfg = Config::default();
        cfg.metric_threshold_overrides.insert(
            "sleep_duration".to_string(),
            MetricThresholdOverride { z_threshold: Some(2.5), slope_threshold: None, instability_ratio_threshold: None },
        );
        let resolved = cfg.thresholds_for("sleep_duration");
        assert_eq!(resolved.z_threshold, 2.5);
        assert_eq!(resolved.slope_threshold, DetectorThresholds::default().slope_threshold);
    }

    #[test]
    fn env_mode_parses_known_values_and_defaults_to_dev() {
        assert_eq!(EnvMode::parse("prod"), EnvMode::Prod);
        assert_eq!(EnvMode::parse("PRODUCTION"), EnvMode::Prod);
        assert_eq!(EnvMode::parse("nonsense"), EnvMode::Dev);
    }
}
