//! Testing utilities and mock implementations
//!
//! A scripted in-memory connector so session engines can be exercised
//! without a Music Assistant server.
//!
//! ```
//! use ma_session::session::{ConnectionTarget, Scheme};
//! use ma_session::testing::MockConnector;
//! use ma_session::transport::Connector;
//!
//! # tokio_test::block_on(async {
//! let (connector, mut server) = MockConnector::new();
//! let endpoint = ConnectionTarget::new("music.local", 8095, Scheme::Http).endpoint("/ws");
//!
//! let _session = connector.open(&endpoint).await.unwrap();
//! let conn = server.next_connection().await.unwrap();
//! assert_eq!(conn.endpoint.url, "ws://music.local:8095/ws");
//! # });
//! ```

pub mod mocks;

pub use mocks::*;
