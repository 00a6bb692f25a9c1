//! Peer connection seam.
//!
//! [`PeerFactory`] creates one [`PeerSession`] per connection attempt. Sessions report
//! asynchronous happenings (gathered candidates, state changes, remote tracks) through a
//! [`PeerEventSink`] stamped with the attempt's generation, so events from a superseded
//! connection can be told apart from the current one.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{InboundStream, LocalMedia};
use crate::protocol::{IceCandidate, Role};

pub mod mock;
pub mod webrtc;

pub use self::webrtc::WebRtcPeerFactory;

pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_disrupted(self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(InboundStream),
}

#[derive(Debug)]
pub struct PeerEvent {
    pub generation: Generation,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: Generation,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns false once the owner stopped listening.
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("malformed ice candidate: {0}")]
    MalformedCandidate(String),
    #[error("peer connection closed")]
    Closed,
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), PeerError>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Creates an answer to the applied remote offer and installs it locally.
    async fn create_answer(&self) -> Result<String, PeerError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Stops event delivery. Called before [`PeerSession::close`].
    async fn detach(&self);

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Viewers get remote tracks reported; cameras only send.
    async fn create(
        &self,
        role: Role,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerSession>, PeerError>;
}
