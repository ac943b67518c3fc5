#![forbid(unsafe_code)]

// Session error taxonomy. Every variant maps to a stable wire code so a peer
// can tell request mistakes from engine trouble.

use crate::media::MediaError;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("receive capabilities share no codec with producer {producer_id}")]
    NotSupported { producer_id: String },

    #[error("{0}")]
    State(String),

    #[error(transparent)]
    Engine(#[from] MediaError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Wire representation of an error class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    NotFound,
    NotSupported,
    State,
    Engine,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::NotFound => "not-found",
            ErrorCode::NotSupported => "not-supported",
            ErrorCode::State => "state",
            ErrorCode::Engine => "engine",
        }
    }
}

impl SessionError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        SessionError::NotFound { kind, id: id.into() }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Validation(_) => ErrorCode::Validation,
            SessionError::NotFound { .. } => ErrorCode::NotFound,
            SessionError::NotSupported { .. } => ErrorCode::NotSupported,
            SessionError::State(_) => ErrorCode::State,
            SessionError::Engine(_) => ErrorCode::Engine,
        }
    }

    /// Engine failures take the peer's transport down with them
    pub fn is_fatal_for_transport(&self) -> bool {
        matches!(self, SessionError::Engine(_))
    }

    pub fn is_engine_wide(&self) -> bool {
        matches!(self, SessionError::Engine(e) if e.is_engine_wide())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_codes() {
        assert_eq!(SessionError::Validation("x".into()).code().as_str(), "validation");
        assert_eq!(SessionError::not_found("producer", "p1").code().as_str(), "not-found");
        assert_eq!(
            SessionError::NotSupported { producer_id: "p1".into() }.code().as_str(),
            "not-supported"
        );
        assert_eq!(SessionError::State("x".into()).code().as_str(), "state");

        let timeout = SessionError::from(MediaError::Timeout {
            operation: "connect",
            after: Duration::from_secs(10),
        });
        assert_eq!(timeout.code(), ErrorCode::Engine);
        assert!(timeout.is_fatal_for_transport());
        assert!(!timeout.is_engine_wide());
    }

    #[test]
    fn test_not_found_message() {
        let err = SessionError::not_found("consumer", "c-7");
        assert_eq!(err.to_string(), "consumer c-7 not found");
    }
}
