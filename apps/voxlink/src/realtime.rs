//! Broadcast transport over the hosted realtime service.
//!
//! Speaks the Phoenix channels v1 JSON protocol on one websocket. Each voice
//! topic maps to the channel `realtime:{topic}`, joined when the first local
//! subscriber arrives and left when the last one goes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, error, info, trace, warn};

use voxlink_protocol::Envelope;
use voxlink_voice::transport::SubscriptionId;
use voxlink_voice::{BroadcastTransport, TransportError};

use crate::config::RealtimeConfig;

/// One Phoenix message, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

fn channel_topic(topic: &str) -> String {
    format!("realtime:{topic}")
}

type JoinReply = Result<(), String>;

#[derive(Default)]
struct Channels {
    topics: HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Envelope>)>>,
    /// Joins waiting for their `phx_reply`, by ref
    pending: HashMap<String, oneshot::Sender<JoinReply>>,
}

fn lock(channels: &Mutex<Channels>) -> MutexGuard<'_, Channels> {
    match channels.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Hand an envelope to every local subscriber of `topic` except `from`
fn deliver(channels: &Mutex<Channels>, topic: &str, from: SubscriptionId, envelope: Envelope) {
    let mut channels = lock(channels);
    if let Some(subscribers) = channels.topics.get_mut(topic) {
        subscribers.retain(|(id, tx)| *id == from || tx.send(envelope.clone()).is_ok());
    }
}

/// `{type: "broadcast", event, payload}` -> envelope
fn envelope_from_broadcast(payload: &Value) -> Option<Envelope> {
    let event = payload.get("event")?.as_str()?.to_string();
    let payload = payload.get("payload").cloned().unwrap_or(Value::Null);
    Some(Envelope { event, payload })
}

fn dispatch(channels: &Mutex<Channels>, frame: PhoenixFrame) {
    match frame.event.as_str() {
        "phx_reply" => {
            let Some(reference) = frame.reference else {
                return;
            };
            let Some(waiter) = lock(channels).pending.remove(&reference) else {
                trace!("Reply {reference} on {}", frame.topic);
                return;
            };
            let status = frame
                .payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("error");
            let result = if status == "ok" {
                Ok(())
            } else {
                Err(frame
                    .payload
                    .get("response")
                    .map(Value::to_string)
                    .unwrap_or_else(|| status.to_string()))
            };
            let _ = waiter.send(result);
        }
        "broadcast" => {
            let Some(topic) = frame.topic.strip_prefix("realtime:") else {
                return;
            };
            match envelope_from_broadcast(&frame.payload) {
                Some(envelope) => deliver(channels, topic, 0, envelope),
                None => warn!("Malformed broadcast on {}", frame.topic),
            }
        }
        "phx_error" | "phx_close" => warn!("Realtime channel {} ended ({})", frame.topic, frame.event),
        other => trace!("Ignoring realtime event {other} on {}", frame.topic),
    }
}

pub struct RealtimeTransport {
    outbound: mpsc::UnboundedSender<PhoenixFrame>,
    channels: Arc<Mutex<Channels>>,
    next_ref: AtomicU64,
    next_id: AtomicU64,
    join_timeout: Duration,
}

impl RealtimeTransport {
    pub async fn connect(config: &RealtimeConfig) -> anyhow::Result<Arc<Self>> {
        let (ws, _response) = tokio_tungstenite::connect_async(config.endpoint())
            .await
            .context("Failed to connect to the realtime service")?;
        info!("Connected to realtime service at {}", config.url);

        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let channels = Arc::new(Mutex::new(Channels::default()));

        tokio::spawn(write_loop(sink, outbound_rx, config.heartbeat_interval));
        tokio::spawn(read_loop(stream, channels.clone()));

        Ok(Arc::new(Self::with_parts(outbound, channels, config.join_timeout)))
    }

    fn with_parts(
        outbound: mpsc::UnboundedSender<PhoenixFrame>,
        channels: Arc<Mutex<Channels>>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            outbound,
            channels,
            next_ref: AtomicU64::new(1),
            next_id: AtomicU64::new(1),
            join_timeout,
        }
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn push(&self, topic: &str, event: &str, payload: Value, reference: String) -> Result<(), String> {
        self.outbound
            .send(PhoenixFrame {
                topic: channel_topic(topic),
                event: event.to_string(),
                payload,
                reference: Some(reference),
            })
            .map_err(|_| "realtime socket closed".to_string())
    }

    async fn join(&self, topic: &str) -> JoinReply {
        let reference = self.next_ref();
        let (tx, rx) = oneshot::channel();
        lock(&self.channels).pending.insert(reference.clone(), tx);

        let payload = json!({
            "config": {
                "broadcast": { "self": false, "ack": false },
                "presence": { "key": "" }
            }
        });
        if let Err(e) = self.push(topic, "phx_join", payload, reference.clone()) {
            lock(&self.channels).pending.remove(&reference);
            return Err(e);
        }

        match tokio::time::timeout(self.join_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("realtime socket closed".into()),
            Err(_) => {
                lock(&self.channels).pending.remove(&reference);
                Err(format!("no join reply within {:?}", self.join_timeout))
            }
        }
    }

    /// Drop one subscriber; returns true if it was the last on the topic
    fn remove(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut channels = lock(&self.channels);
        let Some(subscribers) = channels.topics.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            channels.topics.remove(topic);
            return removed;
        }
        false
    }
}

#[async_trait]
impl BroadcastTransport for RealtimeTransport {
    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Envelope>), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut channels = lock(&self.channels);
            let subscribers = channels.topics.entry(topic.to_string()).or_default();
            subscribers.push((id, tx));
            subscribers.len() == 1
        };

        if first {
            if let Err(reason) = self.join(topic).await {
                self.remove(topic, id);
                return Err(TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason,
                });
            }
            debug!("Joined realtime channel {}", channel_topic(topic));
        }
        Ok((id, rx))
    }

    async fn publish(
        &self,
        topic: &str,
        from: SubscriptionId,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        // The service never echoes to this socket, so local subscribers are served here
        deliver(&self.channels, topic, from, envelope.clone());

        let payload = json!({
            "type": "broadcast",
            "event": envelope.event,
            "payload": envelope.payload,
        });
        self.push(topic, "broadcast", payload, self.next_ref())
            .map_err(|reason| TransportError::Send {
                topic: topic.to_string(),
                reason,
            })
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        if self.remove(topic, id) {
            if let Err(e) = self.push(topic, "phx_leave", json!({}), self.next_ref()) {
                debug!("Leave of {topic} not sent: {e}");
            }
        }
    }
}

async fn write_loop<S>(mut sink: S, mut outbound: mpsc::UnboundedReceiver<PhoenixFrame>, heartbeat: Duration)
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let mut tick = tokio::time::interval(heartbeat);
    // The first tick completes immediately
    tick.tick().await;

    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = tick.tick() => PhoenixFrame {
                topic: "phoenix".into(),
                event: "heartbeat".into(),
                payload: json!({}),
                reference: Some("heartbeat".into()),
            },
        };

        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Cannot encode realtime frame: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
            error!("Realtime socket write failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(mut stream: S, channels: Arc<Mutex<Channels>>)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(frame)) => {
                info!("Realtime socket closed: {frame:?}");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("Realtime socket error: {e}");
                break;
            }
        };
        match serde_json::from_str::<PhoenixFrame>(text.as_str()) {
            Ok(frame) => dispatch(&channels, frame),
            Err(e) => warn!("Unparseable realtime frame: {e}"),
        }
    }

    // Ending every subscription lets sessions notice the socket is gone
    let mut channels = lock(&channels);
    channels.topics.clear();
    channels.pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> (Arc<RealtimeTransport>, mpsc::UnboundedReceiver<PhoenixFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let channels = Arc::new(Mutex::new(Channels::default()));
        (
            Arc::new(RealtimeTransport::with_parts(outbound, channels, Duration::from_secs(1))),
            rx,
        )
    }

    fn reply(frame: &PhoenixFrame, status: &str) -> PhoenixFrame {
        PhoenixFrame {
            topic: frame.topic.clone(),
            event: "phx_reply".into(),
            payload: json!({ "status": status, "response": {} }),
            reference: frame.reference.clone(),
        }
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame: PhoenixFrame = serde_json::from_value(json!({
            "topic": "realtime:voice-room",
            "event": "broadcast",
            "payload": { "type": "broadcast", "event": "user-joined", "payload": { "userId": "u1" } },
            "ref": null
        }))
        .unwrap();
        assert_eq!(frame.reference, None);

        let envelope = envelope_from_broadcast(&frame.payload).unwrap();
        assert_eq!(envelope.event, "user-joined");
        assert_eq!(envelope.payload, json!({ "userId": "u1" }));
    }

    #[tokio::test]
    async fn test_first_subscriber_joins_the_channel() {
        let (transport, mut sent) = transport();

        let joining = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.subscribe("voice-room").await })
        };
        let join = sent.recv().await.unwrap();
        assert_eq!(join.topic, "realtime:voice-room");
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.payload["config"]["broadcast"]["self"], json!(false));

        dispatch(&transport.channels, reply(&join, "ok"));
        let (id, mut rx) = joining.await.unwrap().unwrap();

        // A second local subscriber rides on the same join
        let (other, _other_rx) = transport.subscribe("voice-room").await.unwrap();
        assert!(sent.try_recv().is_err());

        dispatch(
            &transport.channels,
            PhoenixFrame {
                topic: "realtime:voice-room".into(),
                event: "broadcast".into(),
                payload: json!({ "type": "broadcast", "event": "user-left", "payload": { "userId": "u2" } }),
                reference: None,
            },
        );
        assert_eq!(rx.recv().await.unwrap().event, "user-left");

        transport.unsubscribe("voice-room", id).await;
        assert!(sent.try_recv().is_err());
        transport.unsubscribe("voice-room", other).await;
        assert_eq!(sent.recv().await.unwrap().event, "phx_leave");
    }

    #[tokio::test]
    async fn test_rejected_join_fails_subscribe() {
        let (transport, mut sent) = transport();

        let joining = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.subscribe("voice-room").await })
        };
        let join = sent.recv().await.unwrap();
        dispatch(&transport.channels, reply(&join, "error"));

        let result = joining.await.unwrap();
        assert!(matches!(result, Err(TransportError::Subscribe { .. })));
        assert!(lock(&transport.channels).topics.is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_socket_and_local_peers() {
        let (transport, mut sent) = transport();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        lock(&transport.channels)
            .topics
            .insert("audio-room".into(), vec![(7, tx_a), (8, tx_b)]);

        let envelope = Envelope {
            event: "audio-chunk".into(),
            payload: json!({ "userId": "u1" }),
        };
        transport.publish("audio-room", 7, envelope.clone()).await.unwrap();

        let frame = sent.recv().await.unwrap();
        assert_eq!(frame.event, "broadcast");
        assert_eq!(frame.payload["event"], json!("audio-chunk"));
        assert_eq!(rx_b.recv().await.unwrap(), envelope);
        assert!(rx_a.try_recv().is_err());
    }
}
