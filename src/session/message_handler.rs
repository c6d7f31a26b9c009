//! Pure frame routing for established sessions
//!
//! This module classifies inbound frames into replies, events and dropped
//! frames, and fans events out to subscribers.

use crate::error::{SessionError, SessionResult};
use crate::protocol::{
    parse_audio_chunk, InboundMessage, MediaEvent, MediaMessage, ServerEvent, AUTH_MESSAGE_ID,
    ERROR_CODE_AUTH_REQUIRED,
};
use crate::transport::Frame;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Routing decision for one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRoute<E> {
    /// Reply to a correlated request
    Reply {
        message_id: String,
        result: SessionResult<Value>,
        /// Event to publish when no request is waiting on `message_id`
        unmatched: Option<E>,
    },
    /// Push event for subscribers
    Event(E),
    /// Push event that also revokes the session's credential
    CredentialRequired(E),
    /// Frame carries nothing for us
    Drop(String),
}

/// Pure routing decisions for inbound frames
pub struct MessageHandler;

impl MessageHandler {
    /// Route a control-plane frame (pure function)
    pub fn route_control_frame(frame: &Frame) -> FrameRoute<ServerEvent> {
        let Some(text) = frame.as_text() else {
            return FrameRoute::Drop("binary frame on control channel".to_string());
        };

        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => return FrameRoute::Drop(e.to_string()),
        };

        match message {
            InboundMessage::Hello(_) => FrameRoute::Drop("hello after bootstrap".to_string()),
            InboundMessage::Result { message_id, .. } if message_id == AUTH_MESSAGE_ID => {
                FrameRoute::Drop("late authentication reply".to_string())
            }
            InboundMessage::Result { message_id, result } => FrameRoute::Reply {
                message_id,
                result: Ok(result),
                unmatched: None,
            },
            InboundMessage::Error { code, details, .. } if code == ERROR_CODE_AUTH_REQUIRED => {
                FrameRoute::CredentialRequired(ServerEvent::Error { code, details })
            }
            InboundMessage::Error {
                message_id: Some(message_id),
                code,
                details,
            } => FrameRoute::Reply {
                message_id,
                result: Err(SessionError::Server {
                    code,
                    details: details.clone(),
                }),
                unmatched: Some(ServerEvent::Error { code, details }),
            },
            InboundMessage::Error {
                message_id: None,
                code,
                details,
            } => FrameRoute::Event(ServerEvent::Error { code, details }),
            InboundMessage::Event {
                event,
                object_id,
                data,
            } => FrameRoute::Event(ServerEvent::from_push(event, object_id, data)),
        }
    }

    /// Route a media-plane frame (pure function)
    pub fn route_media_frame(frame: &Frame) -> FrameRoute<MediaEvent> {
        match frame {
            Frame::Binary(bytes) => match parse_audio_chunk(bytes.clone()) {
                Ok((timestamp_us, data)) => {
                    FrameRoute::Event(MediaEvent::AudioChunk { timestamp_us, data })
                }
                Err(e) => FrameRoute::Drop(e.to_string()),
            },
            Frame::Text(text) => match MediaMessage::parse(text) {
                Ok(MediaMessage::StreamStart(format)) => {
                    FrameRoute::Event(MediaEvent::StreamStart(format))
                }
                Ok(MediaMessage::StreamEnd) => FrameRoute::Event(MediaEvent::StreamEnd),
                Ok(MediaMessage::Error(message)) => {
                    FrameRoute::Event(MediaEvent::Error { message })
                }
                Ok(MediaMessage::ServerHello(_)) => {
                    FrameRoute::Drop("server/hello after bootstrap".to_string())
                }
                Ok(MediaMessage::Unhandled(kind)) => FrameRoute::Drop(format!("unhandled {kind}")),
                Err(e) => FrameRoute::Drop(e.to_string()),
            },
        }
    }
}

/// Ordered fan-out of events to every current subscriber
///
/// Events are delivered in arrival order. A subscriber that falls more than
/// the buffer behind loses the oldest events and is told how many.
#[derive(Debug)]
pub struct EventDispatcher<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventDispatcher<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Handle for creating subscriptions outside the engine task
    pub fn sender(&self) -> broadcast::Sender<E> {
        self.sender.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; returns how many received it
    pub fn dispatch(&self, event: E) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!(receivers, "Event dispatched");
                receivers
            }
            Err(_) => {
                debug!("Event dropped, no subscribers");
                0
            }
        }
    }
}
