//! Two-party live video over WebRTC: a camera streams to viewers that share a room code.
//!
//! Signaling travels over a topic on a [`signal_relay::Relay`]; media flows peer to peer.

pub mod access;
pub mod candidates;
pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod state;
pub mod telemetry;

pub use error::SessionError;
pub use protocol::{Role, RoomCode};
pub use session::{SessionConfig, SessionDeps, SessionHandle, SessionNotice};
pub use state::ConnectionState;
