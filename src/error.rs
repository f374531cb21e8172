use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the resilience core
#[derive(Error, Debug)]
pub enum VigilError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Upstream server error: {0}")]
    Server(String),

    #[error("Network error: {0}")]
    Network(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Model response errors
    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("Model referenced unknown data: {0}")]
    Hallucination(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Stale data: {0}")]
    StaleData(String),

    // Candidate ledger errors
    #[error("Symbol blacklisted: {symbol} for {remaining_secs}s")]
    Blacklisted { symbol: String, remaining_secs: i64 },

    // Persistence errors
    #[error("Store error: {0}")]
    Store(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for VigilError
pub type Result<T> = std::result::Result<T, VigilError>;

/// Classification of upstream failures tracked per symbol and in the
/// global health metrics. Recorded for every failed call, never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    MalformedResponse,
    AuthFailure,
    ServerError,
    Hallucination,
    RateLimit,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::MalformedResponse => "malformed_response",
            FailureKind::AuthFailure => "auth_failure",
            FailureKind::ServerError => "server_error",
            FailureKind::Hallucination => "hallucination",
            FailureKind::RateLimit => "rate_limit",
        }
    }

    /// Classify a core error into the per-symbol taxonomy.
    pub fn from_error(err: &VigilError) -> Self {
        match err {
            VigilError::Timeout(_) => FailureKind::Timeout,
            VigilError::RateLimited(_) => FailureKind::RateLimit,
            VigilError::Auth(_) => FailureKind::AuthFailure,
            VigilError::Server(_) => FailureKind::ServerError,
            VigilError::Hallucination(_) => FailureKind::Hallucination,
            VigilError::MalformedResponse(_) | VigilError::Json(_) | VigilError::Validation(_) => {
                FailureKind::MalformedResponse
            }
            _ => FailureKind::ServerError,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_classifies_core_errors() {
        assert_eq!(
            FailureKind::from_error(&VigilError::Timeout(30)),
            FailureKind::Timeout
        );
        assert_eq!(
            FailureKind::from_error(&VigilError::RateLimited("429".into())),
            FailureKind::RateLimit
        );
        assert_eq!(
            FailureKind::from_error(&VigilError::Hallucination("DOGEUSDT".into())),
            FailureKind::Hallucination
        );
        assert_eq!(
            FailureKind::from_error(&VigilError::MalformedResponse("no json".into())),
            FailureKind::MalformedResponse
        );
    }

    #[test]
    fn failure_kind_round_trips_serde() {
        let kind = FailureKind::Hallucination;
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, "\"hallucination\"");
        let back: FailureKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
    }
}
