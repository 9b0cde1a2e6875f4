//! Error Taxonomy
//!
//! Shared error type for the agent core. Every variant is recoverable at
//! some boundary: validation errors become user-facing text, quota errors
//! are retried once, external-call errors are captured into results, and
//! state errors reject an illegal approval transition.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Bad user-supplied input: schedule expression, missing action body
    /// field, unknown time zone. Surfaced as conversation text.
    #[error("{0}")]
    Validation(String),

    /// A rate-limit window or cooldown was hit. The caller may retry once
    /// after a short delay before surfacing "try later".
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A reasoning or executor call failed. `rate_limited` marks 429-class
    /// failures eligible for exponential-backoff retry.
    #[error("external call failed: {message}")]
    ExternalCall { message: String, rate_limited: bool },

    /// An approval transition was attempted from a non-pending state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl AgentError {
    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalCall {
            message: message.into(),
            rate_limited: false,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::ExternalCall {
            message: message.into(),
            rate_limited: true,
        }
    }

    /// Whether this error is a 429-class external failure.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            Self::ExternalCall {
                rate_limited: true,
                ..
            }
        )
    }
}
