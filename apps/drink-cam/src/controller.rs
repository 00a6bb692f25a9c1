//! Owns at most one peer connection at a time.
//!
//! Opening always closes the previous connection first, and every failed step closes
//! the connection it was working on before the error is returned.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::candidates::CandidateBuffer;
use crate::media::{InboundStream, LocalMedia};
use crate::peer::{
    Generation, PeerError, PeerEvent, PeerEventKind, PeerEventSink, PeerFactory, PeerSession,
    PeerState, SdpKind,
};
use crate::protocol::{IceCandidate, Role};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{operation} is not available to the {role}")]
    RoleMismatch {
        role: Role,
        operation: &'static str,
    },
    #[error("no active peer connection")]
    NoConnection,
    #[error(transparent)]
    Peer(#[from] PeerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered,
    Dropped,
}

/// Events from the current connection, with the generation stamp removed.
#[derive(Debug)]
pub enum PeerUpdate {
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(InboundStream),
}

struct ActivePeer {
    session: Arc<dyn PeerSession>,
    generation: Generation,
    remote_applied: bool,
}

pub struct PeerController {
    role: Role,
    factory: Arc<dyn PeerFactory>,
    events: mpsc::UnboundedSender<PeerEvent>,
    last_generation: Generation,
    active: Option<ActivePeer>,
    pending: CandidateBuffer,
    local_media: Option<LocalMedia>,
}

impl PeerController {
    pub fn new(
        role: Role,
        factory: Arc<dyn PeerFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            role,
            factory,
            events,
            last_generation: 0,
            active: None,
            pending: CandidateBuffer::new(),
            local_media: None,
        };
        (controller, rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn has_connection(&self) -> bool {
        self.active.is_some()
    }

    pub fn generation(&self) -> Option<Generation> {
        self.active.as_ref().map(|active| active.generation)
    }

    pub fn has_remote_description(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.remote_applied)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    fn require(&self, role: Role, operation: &'static str) -> Result<(), ControllerError> {
        if self.role != role {
            return Err(ControllerError::RoleMismatch {
                role: self.role,
                operation,
            });
        }
        Ok(())
    }

    fn session(&self) -> Result<Arc<dyn PeerSession>, ControllerError> {
        self.active
            .as_ref()
            .map(|active| Arc::clone(&active.session))
            .ok_or(ControllerError::NoConnection)
    }

    async fn open(&mut self) -> Result<Arc<dyn PeerSession>, ControllerError> {
        self.last_generation += 1;
        let generation = self.last_generation;
        let sink = PeerEventSink::new(generation, self.events.clone());
        let session = self.factory.create(self.role, sink).await?;
        self.pending.clear();
        self.active = Some(ActivePeer {
            session: Arc::clone(&session),
            generation,
            remote_applied: false,
        });
        debug!(
            target = "drink_cam::controller",
            generation,
            role = %self.role,
            "peer connection opened",
        );
        Ok(session)
    }

    /// Camera side: opens a connection carrying `media` and returns the local offer.
    pub async fn create_as_offerer(
        &mut self,
        media: LocalMedia,
    ) -> Result<String, ControllerError> {
        self.require(Role::Camera, "create_as_offerer")?;
        self.close().await;
        self.local_media = Some(media);
        let result = self.offer().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn offer(&mut self) -> Result<String, ControllerError> {
        let session = self.open().await?;
        if let Some(media) = &self.local_media {
            session.add_local_media(media).await?;
        }
        Ok(session.create_offer().await?)
    }

    /// Viewer side: opens a receive-only connection.
    pub async fn create_as_answerer(&mut self) -> Result<(), ControllerError> {
        self.require(Role::Viewer, "create_as_answerer")?;
        self.close().await;
        if let Err(err) = self.open().await {
            self.close().await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn apply_remote_offer(&mut self, sdp: &str) -> Result<String, ControllerError> {
        self.require(Role::Viewer, "apply_remote_offer")?;
        let session = self.session()?;
        let result = self.answer(session, sdp).await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn answer(
        &mut self,
        session: Arc<dyn PeerSession>,
        sdp: &str,
    ) -> Result<String, ControllerError> {
        session.set_remote_description(SdpKind::Offer, sdp).await?;
        self.remote_applied(session.as_ref()).await;
        Ok(session.create_answer().await?)
    }

    /// Applies the viewer's answer. Answers after the first one are ignored.
    pub async fn apply_remote_answer(&mut self, sdp: &str) -> Result<(), ControllerError> {
        self.require(Role::Camera, "apply_remote_answer")?;
        let session = self.session()?;
        if self.has_remote_description() {
            debug!(
                target = "drink_cam::controller",
                "ignoring answer for an already answered offer",
            );
            return Ok(());
        }
        if let Err(err) = session.set_remote_description(SdpKind::Answer, sdp).await {
            self.close().await;
            return Err(err.into());
        }
        self.remote_applied(session.as_ref()).await;
        Ok(())
    }

    async fn remote_applied(&mut self, session: &dyn PeerSession) {
        if let Some(active) = self.active.as_mut() {
            active.remote_applied = true;
        }
        let report = self.pending.flush(session).await;
        if report.applied + report.dropped > 0 {
            debug!(
                target = "drink_cam::controller",
                applied = report.applied,
                dropped = report.dropped,
                "flushed buffered candidates"
            );
        }
    }

    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        let Some(active) = &self.active else {
            trace!(target = "drink_cam::controller", "no connection; dropping remote candidate");
            return CandidateDisposition::Dropped;
        };
        if !active.remote_applied {
            self.pending.push(candidate);
            return CandidateDisposition::Buffered;
        }
        match active.session.add_ice_candidate(&candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(err) => {
                debug!(target = "drink_cam::controller", error = %err, "remote candidate rejected");
                CandidateDisposition::Dropped
            }
        }
    }

    /// Filters out events from superseded connections.
    pub fn accept(&self, event: PeerEvent) -> Option<PeerUpdate> {
        if self.generation() != Some(event.generation) {
            trace!(
                target = "drink_cam::controller",
                generation = event.generation,
                "dropping event from a stale connection"
            );
            return None;
        }
        Some(match event.kind {
            PeerEventKind::LocalCandidate(candidate) => PeerUpdate::LocalCandidate(candidate),
            PeerEventKind::StateChanged(state) => PeerUpdate::StateChanged(state),
            PeerEventKind::RemoteTrack(stream) => PeerUpdate::RemoteTrack(stream),
        })
    }

    /// Tears down the connection and local media. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.session.detach().await;
            if let Err(err) = active.session.close().await {
                debug!(
                    target = "drink_cam::controller",
                    error = %err,
                    "peer close reported an error",
                );
            }
            debug!(
                target = "drink_cam::controller",
                generation = active.generation,
                "peer connection closed",
            );
        }
        if let Some(mut media) = self.local_media.take() {
            media.stop();
        }
        self.pending.clear();
    }
}
