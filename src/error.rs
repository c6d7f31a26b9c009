//! Error taxonomy for the session engine
//!
//! Every failure the engine can surface maps onto one `SessionError` variant.
//! The variants follow the recovery policy: transport and bootstrap timeouts
//! are retried by the reconnection policy, request timeouts fail only the one
//! call, authentication failures and exhausted reconnection are terminal until
//! the caller acts.

use std::fmt;
use thiserror::Error;

/// Main error type for session engine operations
///
/// `Clone` because a single connection loss resolves every pending call with
/// the same failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Auth(AuthFailure),

    #[error("timed out: {0}")]
    Timeout(TimeoutKind),

    #[error("reconnection attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("not connected")]
    NotConnected,

    #[error("server error {code}: {details}")]
    Server { code: i64, details: String },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("session engine stopped")]
    EngineStopped,
}

/// Why authentication did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Server requires a credential and none is configured
    Required,
    /// Server rejected the credential or sent a malformed reply
    Rejected,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::Required => f.write_str("authentication required"),
            AuthFailure::Rejected => f.write_str("authentication failed"),
        }
    }
}

/// Which deadline expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No server hello within the bootstrap window
    Hello,
    /// No reply to the authentication frame
    AuthReply,
    /// No reply to a correlated request
    Request,
    /// Caller gave up waiting for the session to come up
    Connect,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Hello => f.write_str("no server hello received"),
            TimeoutKind::AuthReply => f.write_str("no authentication reply received"),
            TimeoutKind::Request => f.write_str("no reply to request"),
            TimeoutKind::Connect => f.write_str("session not established"),
        }
    }
}

impl SessionError {
    /// Create transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    /// Failures the reconnection policy may recover from automatically
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Transport(_) | SessionError::Protocol(_) => true,
            SessionError::Timeout(kind) => matches!(kind, TimeoutKind::Hello | TimeoutKind::AuthReply),
            _ => false,
        }
    }

    /// Failures that need external action (new credential, new manual connect)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::Auth(_) | SessionError::ReconnectExhausted { .. }
        )
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_messages_match_state_reasons() {
        assert_eq!(
            SessionError::Auth(AuthFailure::Required).to_string(),
            "authentication required"
        );
        assert_eq!(
            SessionError::Auth(AuthFailure::Rejected).to_string(),
            "authentication failed"
        );
    }

    #[test]
    fn test_not_connected_message() {
        assert_eq!(SessionError::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SessionError::transport("reset by peer").is_retryable());
        assert!(SessionError::protocol("bad hello").is_retryable());
        assert!(SessionError::Timeout(TimeoutKind::Hello).is_retryable());
        assert!(SessionError::Timeout(TimeoutKind::AuthReply).is_retryable());

        assert!(!SessionError::Timeout(TimeoutKind::Request).is_retryable());
        assert!(!SessionError::Auth(AuthFailure::Rejected).is_retryable());
        assert!(!SessionError::ReconnectExhausted { attempts: 5 }.is_retryable());
        assert!(!SessionError::NotConnected.is_retryable());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(SessionError::Auth(AuthFailure::Required).is_terminal());
        assert!(SessionError::ReconnectExhausted { attempts: 5 }.is_terminal());
        assert!(!SessionError::transport("eof").is_terminal());
        assert!(!SessionError::Timeout(TimeoutKind::Request).is_terminal());
    }

    #[test]
    fn test_json_error_maps_to_protocol() {
        let err: SessionError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn test_server_error_display() {
        let err = SessionError::Server {
            code: 3,
            details: "player not found".to_string(),
        };
        assert_eq!(err.to_string(), "server error 3: player not found");
    }

    #[test]
    fn test_exhausted_display() {
        let err = SessionError::ReconnectExhausted { attempts: 5 };
        assert!(err.to_string().contains('5'));
    }
}
