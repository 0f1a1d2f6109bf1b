use thiserror::Error;

/// How a failed broker response should be handled.
///
/// The classification, not the raw retry count, decides remediation:
/// fatal auth failures must never be retried, transient failures must
/// always be retried up to the cap, and benign conditions are logged
/// and swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Access token expired/invalid/missing. Abort immediately.
    Fatal,
    /// Rate limit or transient server/network error. Retry with backoff.
    Retryable,
    /// Market closed, unknown symbol, invalid order. Log and return no result.
    Benign,
    /// Anything else. Fail without retrying.
    Other,
}

// Broker error codes, matching the REST envelope's `code` field.
const FATAL_CODES: &[i64] = &[-8, -15, -16, -17, -100, -101, -102];
const RETRYABLE_CODES: &[i64] = &[-429, 429, 500, 502, 503, 504];

const FATAL_PATTERNS: &[&str] = &["Token expired", "Invalid Access Token", "token is invalid"];
const BENIGN_PATTERNS: &[&str] = &[
    "Market is in closed state",
    "No data found",
    "Invalid symbol",
    "Invalid order",
];

impl FailureKind {
    /// Classify an error response by its code and message.
    pub fn classify(code: i64, message: &str) -> FailureKind {
        if FATAL_CODES.contains(&code) {
            return FailureKind::Fatal;
        }
        if RETRYABLE_CODES.contains(&code) {
            return FailureKind::Retryable;
        }
        if FATAL_PATTERNS.iter().any(|p| message.contains(p)) {
            return FailureKind::Fatal;
        }
        if BENIGN_PATTERNS.iter().any(|p| message.contains(p)) {
            return FailureKind::Benign;
        }
        FailureKind::Other
    }
}

/// Errors surfaced by the broker layer.
///
/// Only `TokenExpired` crosses the engine's top-level boundary; every
/// other variant is absorbed with a logged outcome where it occurs.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("access token expired or invalid (code {code})")]
    TokenExpired { code: i64 },

    #[error("retries exhausted after {attempts} attempts: {context}")]
    RetriesExhausted { context: String, attempts: u32 },

    #[error("broker rejected request: {message} (code {code})")]
    Rejected { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed broker response: {0}")]
    Malformed(String),
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::TokenExpired { .. })
    }
}
