//! Topic-keyed publish/subscribe feeding subscription source streams.

use parking_lot::Mutex;
use quill_runtime::SourceStream;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

const DEFAULT_CAPACITY: usize = 256;

type Topics = FxHashMap<String, Topic>;

#[derive(Default)]
struct Topic {
    next_id: u64,
    subscribers: FxHashMap<u64, mpsc::Sender<Value>>,
}

/// A publish/subscribe hub for subscriptions.
///
/// Each subscriber gets its own bounded buffer. A subscriber that falls
/// behind misses events instead of slowing down the publisher.
#[derive(Clone)]
pub struct PubSub {
    topics: Arc<Mutex<Topics>>,
    capacity: usize,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(FxHashMap::default())),
            capacity: capacity.max(1),
        }
    }

    /// Registers a subscriber. Stopping the returned stream unregisters it.
    pub fn subscribe(&self, topic: impl Into<String>) -> SourceStream {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = {
            let mut topics = self.topics.lock();
            let entry = topics.entry(topic.clone()).or_default();
            let id = entry.next_id;
            entry.next_id += 1;
            entry.subscribers.insert(id, tx);
            id
        };
        tracing::debug!(%topic, id, "subscribed");

        let topics = Arc::downgrade(&self.topics);
        SourceStream::new(rx, move || unsubscribe(&topics, &topic, id))
    }

    /// Publishes an event, returning how many subscribers received it.
    pub fn publish(&self, topic: &str, event: Value) -> usize {
        let mut topics = self.topics.lock();
        let Some(entry) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        entry.subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%topic, id, "subscriber lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if entry.subscribers.is_empty() {
            topics.remove(topic);
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |entry| entry.subscribers.len())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().len()
    }

    /// A typed view of one topic.
    pub fn topic<T: Serialize>(&self, topic: impl Into<String>) -> TypedTopic<T> {
        TypedTopic {
            pubsub: self.clone(),
            topic: topic.into(),
            _marker: PhantomData,
        }
    }
}

fn unsubscribe(topics: &Weak<Mutex<Topics>>, topic: &str, id: u64) {
    let Some(topics) = topics.upgrade() else {
        return;
    };
    let mut topics = topics.lock();
    if let Some(entry) = topics.get_mut(topic) {
        entry.subscribers.remove(&id);
        if entry.subscribers.is_empty() {
            topics.remove(topic);
        }
    }
    tracing::debug!(%topic, id, "unsubscribed");
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("topics", &self.topic_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Publishes serializable events to a single topic.
pub struct TypedTopic<T> {
    pubsub: PubSub,
    topic: String,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> TypedTopic<T> {
    pub fn publish(&self, event: &T) -> Result<usize, serde_json::Error> {
        let value = serde_json::to_value(event)?;
        Ok(self.pubsub.publish(&self.topic, value))
    }

    pub fn subscribe(&self) -> SourceStream {
        self.pubsub.subscribe(self.topic.clone())
    }
}
