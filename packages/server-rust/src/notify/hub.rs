//! In-process [`NotificationChannel`] backed by [`DashMap`].
//!
//! Each topic holds a list of subscribers, each with an unbounded mpsc
//! sender. Publishing encodes the event once and fans the frame out to every
//! subscriber listening for that event name. Closed subscribers are pruned
//! lazily on publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kombo_core::{NotificationEvent, Topic};
use tokio::sync::mpsc;
use tracing::trace;

use super::subscription::Subscription;
use crate::traits::NotificationChannel;

#[derive(Debug)]
struct Subscriber {
    id: u64,
    event_name: &'static str,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

type TopicTable = DashMap<String, Vec<Subscriber>>;

/// Thread-safe in-memory broadcast hub.
#[derive(Debug)]
pub struct NotificationHub {
    topics: Arc<TopicTable>,
    next_id: AtomicU64,
}

impl NotificationHub {
    /// Creates an empty hub. Subscriber ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of live subscribers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(&topic.to_string())
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }

    /// Number of topics with at least one registered subscriber.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Fans out an already-encoded frame. Returns how many subscribers
    /// received it.
    fn deliver(&self, topic: &str, event_name: &str, frame: &[u8]) -> usize {
        let Some(mut subs) = self.topics.get_mut(topic) else {
            return 0;
        };
        subs.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for sub in subs.iter().filter(|s| s.event_name == event_name) {
            if sub.tx.send(frame.to_vec()).is_ok() {
                delivered += 1;
            }
        }
        let now_empty = subs.is_empty();
        drop(subs);
        if now_empty {
            self.topics.remove_if(topic, |_, subs| subs.is_empty());
        }
        delivered
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_subscriber(topics: &TopicTable, topic: &str, id: u64) {
    if let Some(mut subs) = topics.get_mut(topic) {
        subs.retain(|s| s.id != id);
        let now_empty = subs.is_empty();
        drop(subs);
        if now_empty {
            topics.remove_if(topic, |_, subs| subs.is_empty());
        }
    }
}

#[async_trait]
impl NotificationChannel for NotificationHub {
    async fn publish(&self, topic: &Topic, event: &NotificationEvent) -> anyhow::Result<()> {
        let frame = event.encode()?;
        let topic = topic.to_string();
        let delivered = self.deliver(&topic, event.name(), &frame);
        trace!(topic = %topic, event = event.name(), delivered, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &Topic,
        event_name: &'static str,
    ) -> anyhow::Result<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = topic.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        self.topics
            .entry(name.clone())
            .or_default()
            .push(Subscriber { id, event_name, tx });

        let topics = Arc::clone(&self.topics);
        let release_topic = name.clone();
        Ok(Subscription::new(name, rx, move || {
            remove_subscriber(&topics, &release_topic, id);
        }))
    }
}
