//! Mock implementations for testing
//!
//! Provides a scripted `Connector` whose sessions are driven by the test as
//! if it were the server, so the engine can be exercised without sockets.

use crate::error::SessionError;
use crate::session::connection::Endpoint;
use crate::transport::{Connector, Frame, FrameSink, TransportSession};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as stream_channel;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as SyncMutex};
use tokio::sync::{mpsc, Mutex};

/// What the next `open` call does
#[derive(Debug, Clone, PartialEq)]
pub enum OpenBehavior {
    /// Open succeeds and a `MockServerConnection` is handed to the test
    Accept,
    /// Open fails with a transport error
    Fail(String),
    /// Open never completes
    Hang,
}

/// What the engine did on the client side of a mock session
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Frame(Frame),
    Ping,
    Close,
}

#[derive(Debug, Default)]
struct ConnectorState {
    script: VecDeque<OpenBehavior>,
    opened: Vec<Endpoint>,
}

/// Scripted connector; unscripted opens are accepted
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    connections: mpsc::UnboundedSender<MockServerConnection>,
}

/// Test-side controller for a `MockConnector`
#[derive(Debug)]
pub struct MockServer {
    state: Arc<Mutex<ConnectorState>>,
    connections: mpsc::UnboundedReceiver<MockServerConnection>,
}

impl MockConnector {
    pub fn new() -> (Self, MockServer) {
        let state = Arc::new(Mutex::new(ConnectorState::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::clone(&state),
                connections: tx,
            },
            MockServer {
                state,
                connections: rx,
            },
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<TransportSession, SessionError> {
        let behavior = {
            let mut state = self.state.lock().await;
            state.opened.push(endpoint.clone());
            state.script.pop_front().unwrap_or(OpenBehavior::Accept)
        };

        match behavior {
            OpenBehavior::Accept => {
                let (to_client, inbound) = stream_channel::unbounded();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let ping_failure = Arc::new(SyncMutex::new(None));

                let connection = MockServerConnection {
                    endpoint: endpoint.clone(),
                    to_client,
                    from_client,
                    ping_failure: Arc::clone(&ping_failure),
                };
                self.connections
                    .send(connection)
                    .map_err(|_| SessionError::transport("mock server dropped"))?;

                Ok(TransportSession {
                    sink: Box::new(MockSink {
                        outbound,
                        ping_failure,
                        closed: false,
                    }),
                    stream: inbound.boxed(),
                })
            }
            OpenBehavior::Fail(reason) => Err(SessionError::transport(reason)),
            OpenBehavior::Hang => futures::future::pending().await,
        }
    }
}

impl MockServer {
    /// Queue behaviors for upcoming opens, in order
    pub async fn script(&self, behaviors: impl IntoIterator<Item = OpenBehavior>) {
        self.state.lock().await.script.extend(behaviors);
    }

    pub async fn fail_next(&self, count: usize, reason: &str) {
        self.script((0..count).map(|_| OpenBehavior::Fail(reason.to_string())))
            .await;
    }

    pub async fn open_count(&self) -> usize {
        self.state.lock().await.opened.len()
    }

    pub async fn opened_endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().await.opened.clone()
    }

    /// Next accepted session; `None` once the connector is gone
    pub async fn next_connection(&mut self) -> Option<MockServerConnection> {
        self.connections.recv().await
    }

    /// Accepted session if one is already waiting
    pub fn try_next_connection(&mut self) -> Option<MockServerConnection> {
        self.connections.try_recv().ok()
    }
}

/// Server end of one accepted mock session
///
/// Dropping it ends the engine's inbound stream, which the engine treats as
/// a lost connection.
#[derive(Debug)]
pub struct MockServerConnection {
    pub endpoint: Endpoint,
    to_client: stream_channel::UnboundedSender<Result<Frame, SessionError>>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
    ping_failure: Arc<SyncMutex<Option<String>>>,
}

impl MockServerConnection {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Text(text.into())));
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) {
        let _ = self.to_client.unbounded_send(Ok(Frame::Binary(data.into())));
    }

    /// Deliver a transport error to the engine
    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .unbounded_send(Err(SessionError::transport(reason)));
    }

    /// Make every later liveness probe on this session fail
    pub fn fail_pings(&self, reason: &str) {
        if let Ok(mut failure) = self.ping_failure.lock() {
            *failure = Some(reason.to_string());
        }
    }

    /// End the inbound stream as a server-side close would
    pub fn close(&self) {
        self.to_client.close_channel();
    }

    /// Next thing the engine did on this session
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.from_client.recv().await
    }

    /// Next text frame decoded as JSON, skipping pings
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.recv().await? {
                ClientFrame::Frame(Frame::Text(text)) => return serde_json::from_str(&text).ok(),
                ClientFrame::Ping => continue,
                _ => return None,
            }
        }
    }

    /// Everything the engine has sent so far without waiting
    pub fn drain(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

struct MockSink {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    ping_failure: Arc<SyncMutex<Option<String>>>,
    closed: bool,
}

impl MockSink {
    fn push(&self, frame: ClientFrame) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::transport("session closed"));
        }
        self.outbound
            .send(frame)
            .map_err(|_| SessionError::transport("peer went away"))
    }
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: Frame) -> Result<(), SessionError> {
        self.push(ClientFrame::Frame(frame))
    }

    async fn ping(&mut self) -> Result<(), SessionError> {
        let failure = self.ping_failure.lock().ok().and_then(|f| f.clone());
        if let Some(reason) = failure {
            return Err(SessionError::transport(reason));
        }
        self.push(ClientFrame::Ping)
    }

    async fn close(&mut self) {
        if !self.closed {
            let _ = self.outbound.send(ClientFrame::Close);
            self.closed = true;
        }
    }
}
