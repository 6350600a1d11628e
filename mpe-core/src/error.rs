//! Error taxonomy for the decision pipeline.
//!
//! Every recoverable failure inside a request is folded into a bundle
//! reference carrying a [`ReasonCode`]; only infrastructural failures
//! (malformed PORC, cancelled context) surface as a [`PolicyError`] from
//! `authorize`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason codes attached to bundle references and surfaced errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Normal evaluation, not an error.
    PolicyOutcome,
    /// Raised at registry load only.
    CompilationError,
    /// MRN unknown to the backend.
    NotfoundError,
    /// Backend communication failed (remote backends).
    NetworkError,
    /// AST evaluation raised.
    EvaluationError,
    /// Bad PORC shape or bad options.
    InvalparamError,
    /// Catch-all.
    UnknownError,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReasonCode::PolicyOutcome => "POLICY_OUTCOME",
            ReasonCode::CompilationError => "COMPILATION_ERROR",
            ReasonCode::NotfoundError => "NOTFOUND_ERROR",
            ReasonCode::NetworkError => "NETWORK_ERROR",
            ReasonCode::EvaluationError => "EVALUATION_ERROR",
            ReasonCode::InvalparamError => "INVALPARAM_ERROR",
            ReasonCode::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(s)
    }
}

/// Errors surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("context cancelled")]
    Cancelled,

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    Network(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Unknown(String),
}

impl PolicyError {
    /// The taxonomy code for this error.
    pub fn reason(&self) -> ReasonCode {
        match self {
            PolicyError::InvalidRequest(_) => ReasonCode::InvalparamError,
            PolicyError::Cancelled => ReasonCode::EvaluationError,
            PolicyError::Evaluation(_) => ReasonCode::EvaluationError,
            PolicyError::NotFound(_) => ReasonCode::NotfoundError,
            PolicyError::Network(_) => ReasonCode::NetworkError,
            PolicyError::Json(_) => ReasonCode::InvalparamError,
            PolicyError::Unknown(_) => ReasonCode::UnknownError,
        }
    }
}

pub type Result<T> = std::result::Result<T, PolicyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_serialize_to_wire_names() {
        let json = serde_json::to_string(&ReasonCode::NotfoundError).unwrap();
        assert_eq!(json, "\"NOTFOUND_ERROR\"");
        let json = serde_json::to_string(&ReasonCode::PolicyOutcome).unwrap();
        assert_eq!(json, "\"POLICY_OUTCOME\"");
        let back: ReasonCode = serde_json::from_str("\"INVALPARAM_ERROR\"").unwrap();
        assert_eq!(back, ReasonCode::InvalparamError);
    }

    #[test]
    fn policy_error_maps_to_reason() {
        assert_eq!(
            PolicyError::Cancelled.reason(),
            ReasonCode::EvaluationError
        );
        assert_eq!(
            PolicyError::InvalidRequest("bad".into()).reason(),
            ReasonCode::InvalparamError
        );
    }
}
