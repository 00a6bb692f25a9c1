//! Topic-scoped publish/subscribe channels used to exchange signaling messages.
//!
//! A [`Relay`] hands out one [`RelayChannel`] per joined topic. Payloads are opaque
//! bytes; every subscriber of a topic receives every payload published to it,
//! including the publisher's own (echo). Callers filter their own messages.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

mod local;
mod websocket;
pub mod wire;

pub use local::LocalRelay;
pub use websocket::WsRelay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribing,
    Ready,
    Failed(String),
    Closed,
}

impl ChannelStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ChannelStatus::Subscribing)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay channel closed")]
    Closed,
    #[error("relay transport error: {0}")]
    Transport(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

pub trait Relay: Send + Sync {
    /// Starts subscribing to `topic`. Must be called from within a tokio runtime.
    fn join(&self, topic: &str) -> RelayChannel;
}

/// Outbound half of a joined topic, implemented by each relay backend.
pub trait RelayLink: Send + Sync {
    fn publish(&self, payload: Bytes) -> RelayResult<()>;
    fn close(&self);
}

/// Moves `status` to `next` unless the channel was already closed locally.
pub(crate) fn settle(status: &watch::Sender<ChannelStatus>, next: ChannelStatus) {
    status.send_if_modified(|current| {
        if *current == ChannelStatus::Closed || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

pub struct RelayChannel {
    topic: String,
    link: Arc<dyn RelayLink>,
    status: watch::Receiver<ChannelStatus>,
    inbound: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl RelayChannel {
    pub fn new(
        topic: impl Into<String>,
        link: Arc<dyn RelayLink>,
        status: watch::Receiver<ChannelStatus>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            link,
            status,
            inbound: Some(inbound),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Watch handle for status changes after the channel became ready.
    pub fn status_watch(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Resolves once the subscription settles.
    pub async fn ready(&mut self) -> RelayResult<()> {
        let settled = self
            .status
            .wait_for(ChannelStatus::is_settled)
            .await
            .map_err(|_| RelayError::Closed)?
            .clone();
        match settled {
            ChannelStatus::Ready => Ok(()),
            ChannelStatus::Failed(reason) => Err(RelayError::Unavailable(reason)),
            ChannelStatus::Subscribing | ChannelStatus::Closed => Err(RelayError::Closed),
        }
    }

    pub fn send(&self, payload: Bytes) -> RelayResult<()> {
        match &*self.status.borrow() {
            ChannelStatus::Ready => {}
            ChannelStatus::Subscribing => {
                return Err(RelayError::Unavailable("channel not ready".into()));
            }
            ChannelStatus::Failed(reason) => return Err(RelayError::Unavailable(reason.clone())),
            ChannelStatus::Closed => return Err(RelayError::Closed),
        }
        self.link.publish(payload)
    }

    /// Inbound payload stream. Can be taken once.
    pub fn take_messages(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound.take()
    }

    pub fn close(&self) {
        self.link.close();
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl std::fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel")
            .field("topic", &self.topic)
            .field("status", &*self.status.borrow())
            .finish()
    }
}
