//! Wire formats for the control and media channels
//!
//! `messages` holds the JSON command/event records of the control plane;
//! `media` holds the negotiation records and binary audio framing of the
//! media plane.

pub mod media;
pub mod messages;

pub use media::*;
pub use messages::*;
