//! Transport session abstraction
//!
//! A transport session owns one physical socket. It knows nothing about the
//! protocol: it opens, sends frames, yields inbound frames until the
//! connection ends, answers liveness probes and closes. The engine only talks
//! to these traits so tests can swap the socket for a scripted peer.

use crate::error::SessionError;
use crate::session::connection::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub mod websocket;

pub use websocket::WebSocketConnector;

/// One socket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }
}

/// Outbound half of a transport session
#[async_trait]
pub trait FrameSink: Send {
    /// Fails with a transport error once the session is closed
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError>;

    /// Native liveness probe of the transport
    async fn ping(&mut self) -> Result<(), SessionError>;

    /// Idempotent; safe on an already-closed session
    async fn close(&mut self);
}

/// Inbound half; end of stream means the connection is gone
pub type FrameStream = BoxStream<'static, Result<Frame, SessionError>>;

/// An open socket split into its two halves
pub struct TransportSession {
    pub sink: Box<dyn FrameSink>,
    pub stream: FrameStream,
}

/// Opens transport sessions
///
/// This trait provides an abstraction over the socket implementation
/// to enable dependency injection and testing.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, endpoint: &Endpoint) -> Result<TransportSession, SessionError>;
}
