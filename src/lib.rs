//! Music Assistant session engine
//!
//! A resilient WebSocket client for Music Assistant servers. One generic
//! engine keeps a long-lived session alive: it performs the version-gated
//! authentication handshake, correlates requests with replies, probes the
//! connection, reconnects with linear backoff and fans server pushes out to
//! subscribers. The same engine drives two channels:
//!
//! - the control plane (`/ws`): JSON commands, replies and push events
//! - the media plane (`/sendspin`): player negotiation and binary audio chunks
//!
//! # Quick Start
//!
//! ```no_run
//! use ma_session::session::{ConnectionTarget, ControlProtocol, EngineConfig, SessionEngine};
//! use ma_session::transport::WebSocketConnector;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ma_session::SessionError> {
//! let handle = SessionEngine::spawn(
//!     ControlProtocol::new(),
//!     WebSocketConnector::new(),
//!     EngineConfig::default(),
//! );
//!
//! let target = ConnectionTarget::from_url("http://192.168.1.20:8095", Some("token".into()))?;
//! handle.connect(target).await?;
//! handle.wait_connected(Duration::from_secs(10)).await?;
//!
//! let players = handle.call("players/all", json!({})).await?;
//! println!("{players}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, SessionConfig};
pub use error::{AuthFailure, SessionError, SessionResult, TimeoutKind};
pub use session::{
    ConnectionState, ConnectionTarget, ControlHandle, ControlProtocol, EngineConfig, MediaHandle,
    MediaProtocol, SessionEngine, SessionHandle,
};
