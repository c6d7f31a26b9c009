//! Pure handshake evaluation
//!
//! Decides what follows a server hello and whether an authentication reply
//! completes the bootstrap. No I/O; the caller sends whatever frame comes
//! back and drives the state machine.

use crate::error::{AuthFailure, SessionError};
use crate::protocol::{
    parse_auth_result, CommandMessage, InboundMessage, ServerInfo, AUTH_MESSAGE_ID,
    ERROR_CODE_AUTH_REQUIRED,
};
use tracing::{debug, info};

/// Outcome of evaluating a server hello
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeDecision {
    /// Legacy schema: ready without a credential exchange
    Connected,
    /// Send this frame and wait for its reply
    SendAuth(CommandMessage),
    /// Handshake cannot proceed
    Fail(SessionError),
}

/// Decide the step after a hello (pure function)
pub fn evaluate_hello(info: &ServerInfo, credential: Option<&str>) -> HandshakeDecision {
    if !info.requires_auth() {
        info!(
            server_version = %info.server_version,
            schema_version = info.schema_version,
            "Legacy server schema, skipping authentication"
        );
        return HandshakeDecision::Connected;
    }

    match credential {
        Some(token) if !token.is_empty() => {
            debug!(schema_version = info.schema_version, "Sending credential");
            HandshakeDecision::SendAuth(CommandMessage::auth(token))
        }
        _ => HandshakeDecision::Fail(SessionError::Auth(AuthFailure::Required)),
    }
}

/// Evaluate a frame received while waiting for the auth reply
///
/// `None` means the frame is unrelated to the handshake and should be dropped.
pub fn evaluate_auth_reply(message: &InboundMessage) -> Option<Result<(), SessionError>> {
    match message {
        InboundMessage::Result { message_id, result } if message_id == AUTH_MESSAGE_ID => {
            if parse_auth_result(result) {
                Some(Ok(()))
            } else {
                Some(Err(SessionError::Auth(AuthFailure::Rejected)))
            }
        }
        InboundMessage::Error {
            message_id, code, ..
        } if message_id.as_deref() == Some(AUTH_MESSAGE_ID)
            || *code == ERROR_CODE_AUTH_REQUIRED =>
        {
            Some(Err(SessionError::Auth(AuthFailure::Rejected)))
        }
        _ => None,
    }
}
