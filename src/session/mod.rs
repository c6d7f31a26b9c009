//! Resilient session engine
//!
//! Pure building blocks (state, handshake evaluation, correlation, health
//! decisions, frame routing) live in their own modules; `client` drives them
//! from a single worker task per engine. `protocol` is the seam between that
//! shared lifecycle and the control or media payloads.

pub mod client;
pub mod connection;
pub mod correlator;
pub mod handshake;
pub mod health_monitor;
pub mod message_handler;
pub mod protocol;

pub use client::{SessionEngine, SessionHandle};
pub use connection::{
    ConnectionState, ConnectionTarget, Endpoint, EngineConfig, ReconnectConfig, RetryState, Scheme,
};
pub use health_monitor::{HealthMetrics, Suppression};
pub use message_handler::FrameRoute;
pub use protocol::{BootstrapStep, ControlProtocol, MediaProtocol, SessionProtocol};

use crate::protocol::{MediaEvent, MediaServerHello, ServerEvent, ServerInfo};

/// Handle of a control-plane engine
pub type ControlHandle = SessionHandle<ServerEvent, ServerInfo>;

/// Handle of a media-plane engine
pub type MediaHandle = SessionHandle<MediaEvent, MediaServerHello>;
