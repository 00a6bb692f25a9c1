use tracing::debug;

use crate::peer::PeerSession;
use crate::protocol::IceCandidate;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub dropped: usize,
}

/// Remote candidates that arrived before the remote description was applied.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Applies every buffered candidate in arrival order and empties the buffer.
    /// A candidate the session rejects is dropped; the rest are still applied.
    pub async fn flush(&mut self, session: &dyn PeerSession) -> FlushReport {
        let mut report = FlushReport::default();
        for candidate in std::mem::take(&mut self.pending) {
            match session.add_ice_candidate(&candidate).await {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    debug!(target = "drink_cam::ice", error = %err, "dropping buffered candidate");
                    report.dropped += 1;
                }
            }
        }
        report
    }
}
