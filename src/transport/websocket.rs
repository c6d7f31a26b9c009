//! WebSocket transport built on tokio-tungstenite
//!
//! Attaches the `Origin` header at connect time, maps socket messages onto
//! [`Frame`]s and uses WebSocket ping frames as the liveness probe. Pong
//! replies to server pings are handled by tungstenite.

use super::{Connector, Frame, FrameSink, TransportSession};
use crate::error::SessionError;
use crate::session::connection::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Production connector
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<TransportSession, SessionError> {
        debug!(url = %endpoint.url, origin = %endpoint.origin, "Opening WebSocket");

        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::transport(format!("invalid request: {e}")))?;
        let origin = HeaderValue::from_str(&endpoint.origin)
            .map_err(|e| SessionError::transport(format!("invalid origin header: {e}")))?;
        request.headers_mut().insert("Origin", origin);

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| SessionError::transport(format!("WebSocket connect failed: {e}")))?;

        let (sink, stream) = ws.split();
        let stream = stream
            .filter_map(|message| async move { map_message(message) })
            .boxed();

        debug!(url = %endpoint.url, "WebSocket connected");
        Ok(TransportSession {
            sink: Box::new(WebSocketSink { sink, closed: false }),
            stream,
        })
    }
}

/// Control frames are consumed here; close and errors end the session
fn map_message(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Frame, SessionError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
        Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(Bytes::from(data)))),
        Ok(Message::Close(frame)) => Some(Err(SessionError::transport(match frame {
            Some(frame) => format!("server closed connection: {} {}", frame.code, frame.reason),
            None => "server closed connection".to_string(),
        }))),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
        Err(e) => Some(Err(SessionError::transport(format!("WebSocket error: {e}")))),
    }
}

struct WebSocketSink {
    sink: WsSink,
    closed: bool,
}

impl WebSocketSink {
    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::transport("session is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError> {
        self.ensure_open()?;
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| SessionError::transport(format!("failed to send: {e}")))
    }

    async fn ping(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| SessionError::transport(format!("failed to send ping: {e}")))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WebSocket close did not complete cleanly");
        }
    }
}
