//! In-process message bus.
//!
//! The bus provides publish/subscribe of [`Message`]s with three kinds of
//! subscribers:
//!
//! - **Firehose** receivers ([`MessageBus::subscribe`]) observe every message
//!   in publication order, backed by [`tokio::sync::broadcast`].
//! - **Synchronous topic handlers** ([`MessageBus::on`]) run inline during
//!   [`MessageBus::publish`], in registration order.
//! - **Deferred topic handlers** ([`MessageBus::on_channel`]) receive the
//!   topic's messages through an unbounded channel and process them on their
//!   own task; channel delivery preserves publication order.
//!
//! Messages are wrapped in [`Arc`] so that fan-out does not clone payloads.
//! Delivery failures are never fatal: a message with no subscribers is
//! dropped and callers waiting on a reply simply time out.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use skillbus_kernel::bus::MessageBus;
//! # use skillbus_kernel::message::Message;
//! # async fn example() {
//! let bus = MessageBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(Message::new("mycroft.ready", serde_json::json!({})));
//!
//! let message = rx.recv().await.unwrap();
//! assert_eq!(message.msg_type, "mycroft.ready");
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::message::Message;

/// Identifier returned by topic subscriptions, used to remove them.
pub type SubscriptionId = u64;

/// A synchronous topic handler.
pub type Handler = Arc<dyn Fn(Arc<Message>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Message bus
// ---------------------------------------------------------------------------

/// Publish/subscribe message bus.
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    firehose: broadcast::Sender<Arc<Message>>,
    handlers: DashMap<String, Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
}

impl MessageBus {
    /// Create a new bus whose firehose buffers up to `capacity` messages per
    /// lagging receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                firehose,
                handlers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish a message to the firehose and then to every handler of its
    /// topic.
    ///
    /// Returns the number of deliveries.  Zero is not an error.
    pub fn publish(&self, message: Message) -> usize {
        let message = Arc::new(message);
        let mut delivered = self
            .inner
            .firehose
            .send(Arc::clone(&message))
            .unwrap_or(0);

        // Snapshot the handler list so handlers may publish or (un)subscribe
        // without holding the map shard.
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .get(&message.msg_type)
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(Arc::clone(&message));
            delivered += 1;
        }

        tracing::trace!(topic = %message.msg_type, deliveries = delivered, "message published");
        delivered
    }

    /// Create a firehose receiver that observes all future messages.
    ///
    /// Messages published *before* this call are **not** replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Message>> {
        self.inner.firehose.subscribe()
    }

    /// Register a synchronous handler for `topic`.
    ///
    /// The handler runs inline on the publishing task and must not block.
    /// Handlers that need to await should spawn or use
    /// [`MessageBus::on_channel`].
    pub fn on<F>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Message>) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(topic = %topic, subscription = id, "topic handler registered");
        self.inner
            .handlers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Register a deferred handler for `topic`: matching messages are queued
    /// on the returned channel in publication order.
    pub fn on_channel(
        &self,
        topic: impl Into<String>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<Message>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on(topic, move |message| {
            // A closed receiver only means the consumer went away.
            let _ = tx.send(message);
        });
        (id, rx)
    }

    /// Remove a topic subscription.  Returns `false` if it was not found.
    pub fn remove(&self, topic: &str, id: SubscriptionId) -> bool {
        let Some(mut entry) = self.inner.handlers.get_mut(topic) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(sub, _)| *sub != id);
        let removed = entry.len() != before;
        let empty = entry.is_empty();
        drop(entry);

        if empty {
            self.inner.handlers.remove_if(topic, |_, v| v.is_empty());
        }
        removed
    }

    /// Wait for the next message on `topic`, up to `timeout`.
    pub async fn wait_for_message(&self, topic: &str, timeout: Duration) -> Option<Arc<Message>> {
        let (id, rx) = self.once(topic);
        let result = tokio::time::timeout(timeout, rx).await;
        self.remove(topic, id);
        match result {
            Ok(Ok(message)) => Some(message),
            _ => {
                tracing::debug!(topic = %topic, ?timeout, "no message before timeout");
                None
            }
        }
    }

    /// Publish `message` and wait for the first message on `reply_topic`.
    ///
    /// The reply subscription is installed before publishing so that replies
    /// produced synchronously by handlers are not missed.  Returns `None` on
    /// timeout.
    pub async fn emit_and_wait(
        &self,
        message: Message,
        reply_topic: &str,
        timeout: Duration,
    ) -> Option<Arc<Message>> {
        let (id, rx) = self.once(reply_topic);
        let topic = message.msg_type.clone();
        self.publish(message);

        let result = tokio::time::timeout(timeout, rx).await;
        self.remove(reply_topic, id);
        match result {
            Ok(Ok(reply)) => Some(reply),
            _ => {
                tracing::debug!(
                    topic = %topic,
                    reply_topic = %reply_topic,
                    ?timeout,
                    "no reply before timeout"
                );
                None
            }
        }
    }

    /// Number of live firehose receivers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.firehose.receiver_count()
    }

    /// Number of topic handlers registered for `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner.handlers.get(topic).map(|e| e.len()).unwrap_or(0)
    }

    // -- Private helpers ----------------------------------------------------

    fn once(&self, topic: &str) -> (SubscriptionId, oneshot::Receiver<Arc<Message>>) {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let id = self.on(topic, move |message| {
            let sender = slot.lock().ok().and_then(|mut guard| guard.take());
            if let Some(sender) = sender {
                let _ = sender.send(message);
            }
        });
        (id, rx)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
