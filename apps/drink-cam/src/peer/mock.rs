//! In-memory [`PeerFactory`] that records every call and lets tests drive events.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    Generation, PeerError, PeerEventKind, PeerEventSink, PeerFactory, PeerSession, PeerState,
    SdpKind,
};
use crate::media::{InboundStream, LocalMedia};
use crate::protocol::{IceCandidate, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Create { generation: Generation, role: Role },
    AddLocalMedia { generation: Generation },
    CreateOffer { generation: Generation },
    CreateAnswer { generation: Generation },
    SetRemote { generation: Generation, kind: SdpKind },
    AddCandidate { generation: Generation, candidate: String },
    Detach { generation: Generation },
    Close { generation: Generation },
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<MockCall>>,
    sessions: Mutex<Vec<Arc<MockPeerSession>>>,
    rejected_candidates: Mutex<HashSet<String>>,
    fail_offers: AtomicBool,
    open: AtomicUsize,
    max_open: AtomicUsize,
}

impl Shared {
    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

#[derive(Clone, Default)]
pub struct MockPeerFactory {
    shared: Arc<Shared>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.shared.calls.lock().clone()
    }

    /// Makes `add_ice_candidate` fail for this candidate line.
    pub fn reject_candidate(&self, candidate: &str) {
        self.shared
            .rejected_candidates
            .lock()
            .insert(candidate.to_string());
    }

    pub fn fail_offers(&self, fail: bool) {
        self.shared.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<Arc<MockPeerSession>> {
        self.shared.sessions.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockPeerSession>> {
        self.shared.sessions.lock().last().cloned()
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open sessions seen so far.
    pub fn max_open_sessions(&self) -> usize {
        self.shared.max_open.load(Ordering::SeqCst)
    }

    pub fn applied_candidates(&self, generation: Generation) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::AddCandidate {
                    generation: g,
                    candidate,
                } if g == generation => Some(candidate),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        role: Role,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerSession>, PeerError> {
        let generation = events.generation();
        self.shared.record(MockCall::Create { generation, role });
        let open = self.shared.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_open.fetch_max(open, Ordering::SeqCst);

        let session = Arc::new(MockPeerSession {
            generation,
            role,
            events,
            shared: Arc::clone(&self.shared),
            remote: Mutex::new(None),
            detached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.shared.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

pub struct MockPeerSession {
    generation: Generation,
    role: Role,
    events: PeerEventSink,
    shared: Arc<Shared>,
    remote: Mutex<Option<SdpKind>>,
    detached: AtomicBool,
    closed: AtomicBool,
}

impl MockPeerSession {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    fn emit(&self, kind: PeerEventKind) -> bool {
        if self.is_detached() {
            return false;
        }
        self.events.emit(kind)
    }

    pub fn emit_state(&self, state: PeerState) -> bool {
        self.emit(PeerEventKind::StateChanged(state))
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) -> bool {
        self.emit(PeerEventKind::LocalCandidate(candidate))
    }

    pub fn emit_remote_track(&self, stream: InboundStream) -> bool {
        self.emit(PeerEventKind::RemoteTrack(stream))
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerSession for MockPeerSession {
    async fn add_local_media(&self, _media: &LocalMedia) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.shared.record(MockCall::AddLocalMedia {
            generation: self.generation,
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        self.ensure_open()?;
        self.shared.record(MockCall::CreateOffer {
            generation: self.generation,
        });
        if self.shared.fail_offers.load(Ordering::SeqCst) {
            return Err(PeerError::Negotiation("offer refused".into()));
        }
        Ok(format!("v=0\r\no=mock {} 0 IN IP4 127.0.0.1\r\n", self.generation))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        self.ensure_open()?;
        self.shared.record(MockCall::CreateAnswer {
            generation: self.generation,
        });
        if *self.remote.lock() != Some(SdpKind::Offer) {
            return Err(PeerError::Negotiation("no remote offer".into()));
        }
        Ok(format!("v=0\r\no=mock-answer {} 0 IN IP4 127.0.0.1\r\n", self.generation))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.shared.record(MockCall::SetRemote {
            generation: self.generation,
            kind,
        });
        if !sdp.starts_with("v=0") {
            return Err(PeerError::Negotiation("unparseable sdp".into()));
        }
        *self.remote.lock() = Some(kind);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self
            .shared
            .rejected_candidates
            .lock()
            .contains(&candidate.candidate)
        {
            return Err(PeerError::MalformedCandidate(candidate.candidate.clone()));
        }
        self.shared.record(MockCall::AddCandidate {
            generation: self.generation,
            candidate: candidate.candidate.clone(),
        });
        Ok(())
    }

    async fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.shared.record(MockCall::Detach {
            generation: self.generation,
        });
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.open.fetch_sub(1, Ordering::SeqCst);
        self.shared.record(MockCall::Close {
            generation: self.generation,
        });
        Ok(())
    }
}
