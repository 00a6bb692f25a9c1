use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

const TOPIC_CAPACITY: usize = 256;
pub const MAX_TOPIC_LEN: usize = 128;

/// Topic name -> fan-out channel. A topic exists while it has subscribers.
#[derive(Clone, Default)]
pub struct TopicHub {
    topics: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the topic's publisher and a fresh subscription, creating the topic if needed.
    pub fn subscribe(&self, topic: &str) -> (broadcast::Sender<Bytes>, broadcast::Receiver<Bytes>) {
        // The subscription is taken while the entry is locked so a concurrent release
        // cannot remove the topic in between.
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        let subscription = entry.subscribe();
        (entry.clone(), subscription)
    }

    /// Drops the topic once its last subscriber is gone.
    pub fn release(&self, topic: &str) {
        if self
            .topics
            .remove_if(topic, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            tracing::debug!(topic, "topic released");
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.trim().is_empty() {
        return Err("topic is empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic is too long");
    }
    Ok(())
}
