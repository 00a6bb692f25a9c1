use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::{settle, ChannelStatus, Relay, RelayChannel, RelayError, RelayLink, RelayResult};

const TOPIC_CAPACITY: usize = 64;

type Topics = Arc<RwLock<HashMap<String, broadcast::Sender<Bytes>>>>;

/// In-process relay for tests and single-binary setups. A topic exists while it has
/// subscribers.
#[derive(Debug, Default)]
pub struct LocalRelay {
    topics: Topics,
    reject: Option<String>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay whose every join fails with `reason`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            topics: Topics::default(),
            reject: Some(reason.into()),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Subscribes under the write lock so a concurrent release cannot drop the topic
    /// between lookup and subscribe.
    fn subscribe(&self, topic: &str) -> (broadcast::Sender<Bytes>, TopicSubscription) {
        let mut guard = self.topics.write();
        let sender = guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        let subscription = TopicSubscription {
            receiver: Some(sender.subscribe()),
            topic: topic.to_string(),
            topics: Arc::clone(&self.topics),
        };
        (sender.clone(), subscription)
    }
}

/// Receiving end of a topic. Dropping the last one removes the topic.
struct TopicSubscription {
    receiver: Option<broadcast::Receiver<Bytes>>,
    topic: String,
    topics: Topics,
}

impl TopicSubscription {
    async fn recv(&mut self) -> Result<Bytes, RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.receiver.take();
        let mut guard = self.topics.write();
        if guard
            .get(&self.topic)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            guard.remove(&self.topic);
            trace!(topic = %self.topic, "local relay topic released");
        }
    }
}

impl Relay for LocalRelay {
    fn join(&self, topic: &str) -> RelayChannel {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Subscribing);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        if let Some(reason) = &self.reject {
            status_tx.send_replace(ChannelStatus::Failed(reason.clone()));
            let link = LocalLink {
                sender: None,
                status: status_tx,
                pump: Mutex::new(None),
            };
            return RelayChannel::new(topic, Arc::new(link), status_rx, inbound_rx);
        }

        let (sender, mut subscription) = self.subscribe(topic);
        let topic_name = topic.to_string();
        let pump = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(payload) => {
                        if inbound_tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic_name, skipped, "local relay subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            trace!(topic = %topic_name, "local relay pump ended");
        });
        settle(&status_tx, ChannelStatus::Ready);

        let link = LocalLink {
            sender: Some(sender),
            status: status_tx,
            pump: Mutex::new(Some(pump)),
        };
        RelayChannel::new(topic, Arc::new(link), status_rx, inbound_rx)
    }
}

struct LocalLink {
    sender: Option<broadcast::Sender<Bytes>>,
    status: watch::Sender<ChannelStatus>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RelayLink for LocalLink {
    fn publish(&self, payload: Bytes) -> RelayResult<()> {
        let sender = self.sender.as_ref().ok_or(RelayError::Closed)?;
        sender
            .send(payload)
            .map(|_| ())
            .map_err(|_| RelayError::Closed)
    }

    fn close(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.status.send_replace(ChannelStatus::Closed);
    }
}
