//! Pure connection state management for the session engine
//!
//! This module contains the connection state machine values, the connection
//! target and endpoint derivation, and the retry bookkeeping. Nothing here
//! performs I/O.

use crate::error::SessionError;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Authoritative connection status of one engine instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport session, nothing scheduled
    Disconnected,
    /// Socket opening or waiting for the server hello
    Connecting,
    /// Credential sent, waiting for the handshake reply
    Authenticating,
    /// Ready for requests
    Connected,
    /// Failure with reason; either a reconnection is scheduled or it is terminal
    Error(String),
}

impl ConnectionState {
    /// States in which a manual connect is a no-op
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Authenticating | ConnectionState::Connected
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Authenticating => f.write_str("authenticating"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// HTTP scheme of the server; the socket scheme is derived from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn socket_scheme(&self) -> &'static str {
        match self {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 8095,
            Scheme::Https => 443,
        }
    }
}

/// Where to connect and with which credential
///
/// Retained across reconnect attempts; replaced wholesale by a manual connect.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub credential: Option<String>,
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Parse a server base URL such as `http://192.168.1.20:8095`
    ///
    /// `ws`/`wss` are accepted as aliases of `http`/`https`. Any path on the
    /// URL is ignored; the endpoint path comes from the protocol.
    pub fn from_url(server_url: &str, credential: Option<String>) -> Result<Self, SessionError> {
        let url = Url::parse(server_url)
            .map_err(|e| SessionError::InvalidTarget(format!("{server_url}: {e}")))?;

        let scheme = match url.scheme() {
            "http" | "ws" => Scheme::Http,
            "https" | "wss" => Scheme::Https,
            other => {
                return Err(SessionError::InvalidTarget(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| SessionError::InvalidTarget(format!("{server_url}: missing host")))?;
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self {
            host: host.to_string(),
            port,
            scheme,
            credential: credential.filter(|c| !c.is_empty()),
        })
    }

    /// Origin header value derived from scheme, host and port
    pub fn origin(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }

    /// Socket endpoint for the given path suffix (`/ws`, `/sendspin`)
    pub fn endpoint(&self, path: &str) -> Endpoint {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Endpoint {
            url: format!(
                "{}://{}:{}{}",
                self.scheme.socket_scheme(),
                self.host,
                self.port,
                path
            ),
            origin: self.origin(),
        }
    }
}

/// Fully resolved socket address handed to a `Connector`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub origin: String,
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Automatic attempts before giving up
    pub max_attempts: u32,
    /// Linear backoff step: attempt N waits N × step
    pub backoff_step: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: Duration::from_secs(2),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt number `attempt` (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }

    /// Total time spent waiting if every attempt fails
    pub fn calculate_max_total_time(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|attempt| self.calculate_backoff_delay(attempt))
            .sum()
    }
}

/// Retry bookkeeping owned by the engine worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt_count: u32,
    pub max_attempts: u32,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            max_attempts,
        }
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Force to the ceiling so no automatic attempt follows
    pub fn exhaust(&mut self) {
        self.attempt_count = self.max_attempts;
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Timers governing one engine instance
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Window for the server hello after the socket opens
    pub hello_timeout: Duration,
    /// Per-request reply window (also bounds the auth reply)
    pub request_timeout: Duration,
    /// Liveness probe period while connected
    pub keepalive_interval: Duration,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(20),
            event_buffer: 256,
            reconnect: ReconnectConfig::default(),
        }
    }
}
