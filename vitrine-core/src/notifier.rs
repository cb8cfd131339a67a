//! Per-product fan-out of reservation changes.
//!
//! Each product gets its own `broadcast` channel, created on first subscribe
//! and dropped when its last subscriber leaves. Publishing never blocks: a
//! slow watcher lags and skips events instead of holding up the write path.
//!
//! Events carry the record's `revision`. A topic forwards an event only if its
//! revision is newer than the last one it forwarded, so watchers see a
//! product's changes in commit order even when publishers race, and relayed
//! copies of events already delivered locally are discarded.

use futures_util::Stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, warn};
use vitrine_shared::ReservationEvent;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

struct Topic {
    sender: broadcast::Sender<ReservationEvent>,
    last_revision: u64,
}

type Topics = Arc<Mutex<HashMap<String, Topic>>>;

fn lock(topics: &Topics) -> MutexGuard<'_, HashMap<String, Topic>> {
    topics.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct ChangeNotifier {
    topics: Topics,
    capacity: usize,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Forwards `event` to the product's watchers. Returns how many received it.
    pub fn publish(&self, event: ReservationEvent) -> usize {
        let mut topics = lock(&self.topics);
        let Some(topic) = topics.get_mut(&event.product_id) else {
            return 0;
        };

        if event.revision <= topic.last_revision {
            debug!(
                product_id = %event.product_id,
                revision = event.revision,
                last_revision = topic.last_revision,
                "Dropping stale reservation event"
            );
            return 0;
        }

        topic.last_revision = event.revision;
        topic.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, product_id: &str) -> ReservationSubscription {
        let mut topics = lock(&self.topics);
        let capacity = self.capacity;
        let topic = topics.entry(product_id.to_string()).or_insert_with(|| Topic {
            sender: broadcast::channel(capacity).0,
            last_revision: 0,
        });

        ReservationSubscription {
            product_id: product_id.to_string(),
            receiver: Some(topic.sender.subscribe()),
            topics: Arc::clone(&self.topics),
            pending: None,
            last_seen: 0,
        }
    }

    /// Runs `callback` for every event on `product_id` until the returned
    /// handle is unsubscribed or dropped.
    pub fn subscribe_with<F>(&self, product_id: &str, mut callback: F) -> SubscriptionHandle
    where
        F: FnMut(ReservationEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe(product_id);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(event);
            }
        });
        SubscriptionHandle { task }
    }

    pub fn topic_count(&self) -> usize {
        lock(&self.topics).len()
    }

    pub fn subscriber_count(&self, product_id: &str) -> usize {
        lock(&self.topics)
            .get(product_id)
            .map_or(0, |topic| topic.sender.receiver_count())
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

/// A watcher's view of one product. Dropping it unsubscribes.
pub struct ReservationSubscription {
    product_id: String,
    receiver: Option<broadcast::Receiver<ReservationEvent>>,
    topics: Topics,
    pending: Option<ReservationEvent>,
    last_seen: u64,
}

impl ReservationSubscription {
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Queues the state read right after subscribing, so the first `recv`
    /// returns it. Events at or below its revision are skipped afterwards.
    pub fn prime(&mut self, snapshot: ReservationEvent) {
        if snapshot.revision > self.last_seen {
            self.last_seen = snapshot.revision;
            self.pending = Some(snapshot);
        }
    }

    /// Next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ReservationEvent> {
        if let Some(snapshot) = self.pending.take() {
            return Some(snapshot);
        }

        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) if event.revision <= self.last_seen => continue,
                Ok(event) => {
                    self.last_seen = event.revision;
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(product_id = %self.product_id, skipped, "Reservation watcher lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    /// Stream adapter for transports (SSE, websockets). Lagged gaps are skipped.
    pub fn into_stream(mut self) -> impl Stream<Item = ReservationEvent> + Send + 'static {
        let snapshot = self.pending.take();
        let mut last_seen = self.last_seen;
        let product_id = self.product_id.clone();
        // An already detached subscription yields a closed channel.
        let receiver = self
            .receiver
            .take()
            .unwrap_or_else(|| broadcast::channel(1).1);
        let guard = TopicGuard {
            product_id: product_id.clone(),
            topics: Arc::clone(&self.topics),
        };
        drop(self);

        let live = BroadcastStream::new(receiver)
            .filter_map(move |item| {
                // Keeps the topic registered while the stream is alive.
                let _guard = &guard;
                match item {
                    Ok(event) if event.revision > last_seen => {
                        last_seen = event.revision;
                        Some(event)
                    }
                    Ok(_) => None,
                    Err(err) => {
                        warn!(product_id = %product_id, "Reservation stream lagged: {}", err);
                        None
                    }
                }
            });

        tokio_stream::iter(snapshot).chain(live)
    }

    fn detach(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            drop(receiver);
            prune_topic(&self.topics, &self.product_id);
        }
    }
}

impl Drop for ReservationSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

struct TopicGuard {
    product_id: String,
    topics: Topics,
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        prune_topic(&self.topics, &self.product_id);
    }
}

/// Removes the topic once nobody listens. The receiver must already be dropped.
fn prune_topic(topics: &Topics, product_id: &str) {
    let mut topics = lock(topics);
    let empty = topics
        .get(product_id)
        .is_some_and(|topic| topic.sender.receiver_count() == 0);
    if empty {
        topics.remove(product_id);
        debug!(product_id, "Removed reservation topic without subscribers");
    }
}

/// Handle for a callback subscription.
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
