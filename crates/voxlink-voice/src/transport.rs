//! Broadcast topic transport.
//!
//! A topic is a named publish/subscribe channel: every subscriber sees every
//! message published by any other subscriber. No persistence, no delivery
//! guarantee, no presence tracking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use voxlink_protocol::{Envelope, SignalMessage};

use crate::error::TransportError;

pub type SubscriptionId = u64;

/// Publish/subscribe backend (hosted realtime service, in-process hub, ...).
#[async_trait]
pub trait BroadcastTransport: Send + Sync + 'static {
    /// Join a topic. Inbound envelopes arrive on the returned receiver.
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Envelope>), TransportError>;

    /// Publish to every subscriber of `topic` except `from`.
    async fn publish(
        &self,
        topic: &str,
        from: SubscriptionId,
        envelope: Envelope,
    ) -> Result<(), TransportError>;

    /// Leave a topic. Unknown ids are ignored.
    async fn unsubscribe(&self, topic: &str, id: SubscriptionId);
}

/// Cloneable send half of a subscription
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn BroadcastTransport>,
    topic: String,
    id: SubscriptionId,
    retry_backoff: Duration,
}

impl Publisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish an envelope, retrying once after the configured backoff.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        match self
            .transport
            .publish(&self.topic, self.id, envelope.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "Send '{}' on {} failed ({e}), retrying in {:?}",
                    envelope.event, self.topic, self.retry_backoff
                );
                tokio::time::sleep(self.retry_backoff).await;
                self.transport.publish(&self.topic, self.id, envelope).await
            }
        }
    }

    /// Serialize and publish a signaling message
    pub async fn send_message(&self, message: &SignalMessage) -> Result<(), TransportError> {
        let envelope = message.to_envelope().map_err(|e| TransportError::Send {
            topic: self.topic.clone(),
            reason: e.to_string(),
        })?;
        trace!("-> {} {}", self.topic, envelope.event);
        self.send(envelope).await
    }
}

/// Live membership of one topic. Dropping it leaves the topic.
pub struct Subscription {
    publisher: Publisher,
    events: mpsc::UnboundedReceiver<Envelope>,
    closed: bool,
}

impl Subscription {
    /// Join `topic`, retrying once after `retry_backoff`.
    pub async fn open(
        transport: Arc<dyn BroadcastTransport>,
        topic: impl Into<String>,
        retry_backoff: Duration,
    ) -> Result<Self, TransportError> {
        let topic = topic.into();
        let (id, events) = match transport.subscribe(&topic).await {
            Ok(joined) => joined,
            Err(e) => {
                warn!("Subscribe to {topic} failed ({e}), retrying in {retry_backoff:?}");
                tokio::time::sleep(retry_backoff).await;
                transport.subscribe(&topic).await?
            }
        };
        debug!("Subscribed to {topic} as #{id}");

        Ok(Self {
            publisher: Publisher {
                transport,
                topic,
                id,
                retry_backoff,
            },
            events,
            closed: false,
        })
    }

    pub fn topic(&self) -> &str {
        &self.publisher.topic
    }

    pub fn id(&self) -> SubscriptionId {
        self.publisher.id
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Next inbound envelope; `None` once the transport dropped us.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }

    pub async fn send_message(&self, message: &SignalMessage) -> Result<(), TransportError> {
        self.publisher.send_message(message).await
    }

    /// Leave the topic
    pub async fn close(mut self) {
        self.closed = true;
        self.events.close();
        self.publisher
            .transport
            .unsubscribe(&self.publisher.topic, self.publisher.id)
            .await;
        debug!("Unsubscribed from {} (#{})", self.publisher.topic, self.publisher.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let transport = self.publisher.transport.clone();
        let topic = self.publisher.topic.clone();
        let id = self.publisher.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { transport.unsubscribe(&topic, id).await });
        }
    }
}

#[derive(Default)]
struct HubInner {
    next_id: SubscriptionId,
    topics: HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Envelope>)>>,
}

/// In-process broadcast hub. Every client sharing the hub sees the same topics.
#[derive(Default)]
pub struct LocalBroadcastHub {
    inner: Mutex<HubInner>,
}

impl LocalBroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Deliver an envelope to every subscriber of `topic`, as an outside publisher would.
    pub fn inject(&self, topic: &str, envelope: Envelope) {
        self.deliver(topic, 0, envelope);
    }

    /// Serialize and inject a signaling message
    pub fn inject_message(&self, topic: &str, message: &SignalMessage) {
        match message.to_envelope() {
            Ok(envelope) => self.inject(topic, envelope),
            Err(e) => warn!("Cannot inject message on {topic}: {e}"),
        }
    }

    fn deliver(&self, topic: &str, from: SubscriptionId, envelope: Envelope) {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.topics.get_mut(topic) {
            subscribers.retain(|(id, tx)| {
                if *id == from {
                    return true;
                }
                tx.send(envelope.clone()).is_ok()
            });
        }
    }
}

#[async_trait]
impl BroadcastTransport for LocalBroadcastHub {
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Envelope>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.topics.entry(topic.to_string()).or_default().push((id, tx));
        Ok((id, rx))
    }

    async fn publish(
        &self,
        topic: &str,
        from: SubscriptionId,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        self.deliver(topic, from, envelope);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut inner = self.lock();
        if let Some(subscribers) = inner.topics.get_mut(topic) {
            subscribers.retain(|(sid, _)| *sid != id);
            if subscribers.is_empty() {
                inner.topics.remove(topic);
            }
        }
    }
}
