//! Per-channel protocol behavior plugged into the session engine
//!
//! The engine owns the lifecycle (connect, reconnect, timers, correlation);
//! a `SessionProtocol` owns what travels over the wire: the endpoint path,
//! the bootstrap exchange and the classification of frames once live.

use super::connection::ConnectionTarget;
use super::handshake::{evaluate_auth_reply, evaluate_hello, HandshakeDecision};
use super::message_handler::{FrameRoute, MessageHandler};
use crate::error::{SessionError, SessionResult};
use crate::protocol::{
    ClientHello, CommandMessage, InboundMessage, MediaEnvelope, MediaEvent, MediaMessage,
    MediaServerHello, ServerEvent, ServerInfo,
};
use crate::transport::Frame;
use serde_json::Value;
use std::fmt::Debug;
use tracing::{debug, warn};

/// Outcome of feeding one frame to the bootstrap exchange
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapStep<E> {
    /// Not part of the bootstrap; dropped
    Ignore,
    /// Send this credential frame and wait for its reply
    Authenticate(Frame),
    /// Session is live; the optional event is published to subscribers
    Connected(Option<E>),
    /// Attempt failed
    Fail(SessionError),
}

/// Wire behavior of one channel
pub trait SessionProtocol: Send + 'static {
    /// Events published to subscribers
    type Event: Clone + Debug + Send + 'static;
    /// Server identity captured during bootstrap
    type Info: Clone + Debug + Send + Sync + 'static;

    /// Channel name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Path suffix appended to the target (`/ws`, `/sendspin`)
    fn endpoint_path(&self) -> &'static str;

    /// Frames the client sends as soon as the socket opens
    fn opening_frames(&mut self, target: &ConnectionTarget) -> SessionResult<Vec<Frame>>;

    /// Feed a frame received before the session is live
    fn on_bootstrap_frame(
        &mut self,
        frame: &Frame,
        target: &ConnectionTarget,
    ) -> BootstrapStep<Self::Event>;

    /// Classify a frame received while live
    fn route(&mut self, frame: &Frame) -> FrameRoute<Self::Event>;

    /// Server identity of the current connection
    fn session_info(&self) -> Option<Self::Info>;

    /// Encode a correlated request
    fn encode_request(&self, message_id: &str, command: &str, args: Value) -> SessionResult<Frame>;

    /// Encode a fire-and-forget message
    fn encode_notification(&self, command: &str, args: Value) -> SessionResult<Frame>;

    /// Discard per-connection state before a new attempt
    fn reset(&mut self);
}

/// Control channel: hello, optional token handshake, JSON command/reply/event
#[derive(Debug, Default)]
pub struct ControlProtocol {
    server_info: Option<ServerInfo>,
    awaiting_auth: bool,
}

impl ControlProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionProtocol for ControlProtocol {
    type Event = ServerEvent;
    type Info = ServerInfo;

    fn name(&self) -> &'static str {
        "control"
    }

    fn endpoint_path(&self) -> &'static str {
        "/ws"
    }

    fn opening_frames(&mut self, _target: &ConnectionTarget) -> SessionResult<Vec<Frame>> {
        // The server speaks first
        Ok(Vec::new())
    }

    fn on_bootstrap_frame(
        &mut self,
        frame: &Frame,
        target: &ConnectionTarget,
    ) -> BootstrapStep<ServerEvent> {
        let Some(text) = frame.as_text() else {
            return BootstrapStep::Ignore;
        };

        if self.awaiting_auth {
            let message = match InboundMessage::parse(text) {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "Ignoring unparseable frame during authentication");
                    return BootstrapStep::Ignore;
                }
            };
            return match evaluate_auth_reply(&message) {
                Some(Ok(())) => {
                    self.awaiting_auth = false;
                    BootstrapStep::Connected(None)
                }
                Some(Err(e)) => BootstrapStep::Fail(e),
                None => BootstrapStep::Ignore,
            };
        }

        let info = match ServerInfo::from_frame(text) {
            None => return BootstrapStep::Ignore,
            Some(Err(e)) => return BootstrapStep::Fail(e),
            Some(Ok(info)) => info,
        };

        let decision = evaluate_hello(&info, target.credential.as_deref());
        self.server_info = Some(info);

        match decision {
            HandshakeDecision::Connected => BootstrapStep::Connected(None),
            HandshakeDecision::SendAuth(message) => match message.to_json() {
                Ok(json) => {
                    self.awaiting_auth = true;
                    BootstrapStep::Authenticate(Frame::Text(json))
                }
                Err(e) => BootstrapStep::Fail(e),
            },
            HandshakeDecision::Fail(e) => BootstrapStep::Fail(e),
        }
    }

    fn route(&mut self, frame: &Frame) -> FrameRoute<ServerEvent> {
        MessageHandler::route_control_frame(frame)
    }

    fn session_info(&self) -> Option<ServerInfo> {
        self.server_info.clone()
    }

    fn encode_request(&self, message_id: &str, command: &str, args: Value) -> SessionResult<Frame> {
        Ok(Frame::Text(
            CommandMessage::new(message_id, command, args).to_json()?,
        ))
    }

    fn encode_notification(&self, command: &str, args: Value) -> SessionResult<Frame> {
        // The control channel has no uncorrelated sends; a fresh id the
        // engine never waits on gives fire-and-forget semantics
        let message_id = uuid::Uuid::new_v4().simple().to_string();
        self.encode_request(&message_id, command, args)
    }

    fn reset(&mut self) {
        self.server_info = None;
        self.awaiting_auth = false;
    }
}

/// Media channel: client/hello, server/hello, then stream records and audio
#[derive(Debug)]
pub struct MediaProtocol {
    hello: ClientHello,
    server: Option<MediaServerHello>,
}

impl MediaProtocol {
    pub fn new(hello: ClientHello) -> Self {
        Self {
            hello,
            server: None,
        }
    }

    pub fn client_hello(&self) -> &ClientHello {
        &self.hello
    }
}

impl SessionProtocol for MediaProtocol {
    type Event = MediaEvent;
    type Info = MediaServerHello;

    fn name(&self) -> &'static str {
        "media"
    }

    fn endpoint_path(&self) -> &'static str {
        "/sendspin"
    }

    fn opening_frames(&mut self, _target: &ConnectionTarget) -> SessionResult<Vec<Frame>> {
        let envelope = MediaEnvelope::client_hello(&self.hello)?;
        Ok(vec![Frame::Text(envelope.to_json()?)])
    }

    fn on_bootstrap_frame(
        &mut self,
        frame: &Frame,
        _target: &ConnectionTarget,
    ) -> BootstrapStep<MediaEvent> {
        let Some(text) = frame.as_text() else {
            return BootstrapStep::Ignore;
        };

        match MediaMessage::parse(text) {
            Ok(MediaMessage::ServerHello(server)) => {
                debug!(server_id = %server.server_id, "Media server hello received");
                self.server = Some(server.clone());
                BootstrapStep::Connected(Some(MediaEvent::Connected(server)))
            }
            Ok(MediaMessage::Error(message)) => {
                warn!(message = %message, "Media server rejected client hello");
                BootstrapStep::Fail(SessionError::protocol(message))
            }
            Ok(_) => BootstrapStep::Ignore,
            Err(e) => {
                debug!(error = %e, "Ignoring unparseable media frame during bootstrap");
                BootstrapStep::Ignore
            }
        }
    }

    fn route(&mut self, frame: &Frame) -> FrameRoute<MediaEvent> {
        MessageHandler::route_media_frame(frame)
    }

    fn session_info(&self) -> Option<MediaServerHello> {
        self.server.clone()
    }

    fn encode_request(
        &self,
        _message_id: &str,
        command: &str,
        _args: Value,
    ) -> SessionResult<Frame> {
        Err(SessionError::protocol(format!(
            "media channel does not correlate requests ({command})"
        )))
    }

    fn encode_notification(&self, command: &str, args: Value) -> SessionResult<Frame> {
        Ok(Frame::Text(MediaEnvelope::new(command, args).to_json()?))
    }

    fn reset(&mut self) {
        self.server = None;
    }
}
