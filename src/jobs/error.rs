use std::time::Duration;
use thiserror::Error;

/// Whether a failed attempt is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network timeout, rate limit, upstream 5xx
    Transient,
    /// Malformed payload or a request the upstream will never accept
    Permanent,
}

/// Classified failure returned by a job handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct JobError {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Handler exceeded its time budget
    pub fn timeout(after: Duration) -> Self {
        Self::transient("timeout", format!("handler timed out after {}s", after.as_secs()))
    }

    /// Handler panicked; retrying would most likely panic again
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::permanent("handler_panicked", message)
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::permanent("invalid_payload", message)
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

impl From<crate::connectors::ConnectorError> for JobError {
    fn from(err: crate::connectors::ConnectorError) -> Self {
        use crate::connectors::ConnectorError;

        let code = match &err {
            ConnectorError::Unavailable { .. } => "connector_unavailable",
            ConnectorError::InvalidState => "invalid_state",
            ConnectorError::TokenRefreshFailed { .. } => "reconnect_required",
            ConnectorError::Exchange { .. } => "exchange_failed",
            ConnectorError::Transport { .. } => "connector_transport",
            ConnectorError::Profile { .. } => "profile_failed",
        };

        if err.is_transient() {
            Self::transient(code, err.to_string())
        } else {
            Self::permanent(code, err.to_string())
        }
    }
}
