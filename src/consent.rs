//! C18: Consent Gate.
//!
//! Every operation that touches user data passes through [`require_scope`]
//! first. Grounded on `original_source/backend/app/api/consent_gate.py`:
//! resolve the latest consent record, reject if revoked, then check the
//! scope the caller asked for. Provider-ingestion consent is deliberately
//! decoupled from analysis consent (spec.md §3 Consent invariant).

use crate::models::Consent;
use thiserror::Error;

/// The scope an operation needs validated. `ProviderIngestion` carries the
/// vendor name so the gate can look up that vendor's specific flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentScope {
    DataAnalysis,
    ExperimentalRecommendations,
    ProviderIngestion(String),
}

impl ConsentScope {
    fn reason_code(&self) -> String {
        match self {
            ConsentScope::DataAnalysis => "scope_data_analysis_denied".to_string(),
            ConsentScope::ExperimentalRecommendations => {
                "scope_experimental_recommendations_denied".to_string()
            }
            ConsentScope::ProviderIngestion(vendor) => format!("scope_{vendor}_denied"),
        }
    }
}

/// Machine-readable, non-leaking reason code (spec.md §4.15 / §7
/// `ConsentGateError`: "never reveals existence of other users' data").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsentError {
    #[error("no_consent")]
    NoConsent,
    #[error("consent_revoked")]
    ConsentRevoked,
    #[error("{0}")]
    ScopeDenied(String),
}

impl ConsentError {
    pub fn reason_code(&self) -> &str {
        match self {
            ConsentError::NoConsent => "no_consent",
            ConsentError::ConsentRevoked => "consent_revoked",
            ConsentError::ScopeDenied(code) => code,
        }
    }
}

/// Resolve the latest consent record (if any) and validate the requested
/// scope. Returns a scoped error code on every failure path; never panics,
/// never distinguishes "user doesn't exist" from "no consent on file".
pub fn require_scope(
    consent: &Consent,
    scope: ConsentScope,
) -> Result<(), ConsentError> {
    if consent.is_revoked() {
        return Err(ConsentError::ConsentRevoked);
    }

    let granted = match &scope {
        ConsentScope::DataAnalysis => consent.data_analysis,
        ConsentScope::ExperimentalRecommendations => consent.experimental_recommendations,
        ConsentScope::ProviderIngestion(vendor) => {
            consent.provider_ingestion.get(vendor).copied().unwrap_or(false)
        }
    };

    if !granted {
        return Err(ConsentError::ScopeDenied(scope.reason_code()));
    }

    Ok(())
}

/// Convenience wrapper for call sites that only have an `Option<&Consent>`
/// (no record on file at all maps to `NoConsent`, matching spec.md §4.15(b)).
pub fn require_scope_opt(
    consent: Option<&Consent>,
    scope: ConsentScope,
) -> Result<(), ConsentError> {
    match consent {
        None => Err(ConsentError::NoConsent),
        Some(c) => require_scope(c, scope),
    }
}
