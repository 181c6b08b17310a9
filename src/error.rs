//! Error types for stepstream
//!
//! Every failure a run can hit maps onto one `StreamError` variant. The run
//! driver decides per variant whether the client sees anything:
//!
//! - `Auth` fails the run before streaming starts
//! - `Engine` / `MalformedStepPayload` end the run with one error envelope
//! - `Cancelled` is internal only and never reaches the client as an error
//! - `Persistence` is logged and swallowed after a successful stream

use thiserror::Error;

/// Errors that can occur while driving a run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Caller identity could not be decoded (invalid or expired token).
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A run with the same id is already registered.
    #[error("Run already active: {0}")]
    DuplicateRun(String),

    /// The step producer raised.
    #[error("Engine error: {0}")]
    Engine(String),

    /// A step payload lacks a field its extraction rule needs.
    #[error("Malformed payload for step '{step}': missing or invalid field '{field}'")]
    MalformedStepPayload {
        /// Step whose payload was inspected
        step: String,
        /// Field that was expected
        field: String,
    },

    /// The run was asked to stop.
    #[error("Run cancelled")]
    Cancelled,

    /// The transcript could not be saved.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The client channel is closed.
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An envelope could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StreamError {
    /// Shorthand for a malformed payload error.
    pub fn malformed(step: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MalformedStepPayload {
            step: step.into(),
            field: field.into(),
        }
    }

    /// Whether this error ends the run through the FAILED path.
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, Self::Engine(_) | Self::MalformedStepPayload { .. })
    }

    /// Whether this error may be reported to the client at all.
    pub fn is_client_visible(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::ClientDisconnected)
    }

    /// Message text suitable for an error envelope.
    pub fn user_message(&self) -> String {
        match self {
            Self::Auth(_) => "Authentication failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for stepstream operations
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_payload_counts_as_engine_failure() {
        let err = StreamError::malformed("sql_generator", "generated_sql");
        assert!(err.is_engine_failure());
        assert!(err.to_string().contains("generated_sql"));
        assert!(StreamError::Engine("boom".into()).is_engine_failure());
        assert!(!StreamError::Persistence("db down".into()).is_engine_failure());
    }

    #[test]
    fn cancellation_is_never_client_visible() {
        assert!(!StreamError::Cancelled.is_client_visible());
        assert!(!StreamError::ClientDisconnected.is_client_visible());
        assert!(StreamError::Engine("x".into()).is_client_visible());
    }

    #[test]
    fn auth_user_message_hides_detail() {
        let err = StreamError::Auth("signature mismatch for token abc".into());
        assert_eq!(err.user_message(), "Authentication failed");
    }
}
