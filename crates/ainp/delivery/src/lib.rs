//! Real-time delivery fabric.
//!
//! Connected sessions are keyed by DID; one DID may hold several
//! connections. Frames fan out over bounded broadcast channels — a lagging
//! connection drops its oldest frames (logged at the socket) rather than
//! back-pressuring the broker. The consumer bridge polls each connected
//! recipient's durable consumer and forwards envelopes; acks come back from
//! the client, so unacked deliveries replay after the stream's visibility
//! window.

#![deny(unsafe_code)]

use ainp_stream::{consumer_name, intents_subject, IntentStream, StreamError};
use ainp_types::{Did, Envelope, Notification};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Frames pushed to connected sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum SessionFrame {
    /// Broker-originated notification.
    Notification(Notification),
    /// A durable-stream envelope awaiting a client ack.
    Envelope {
        delivery_id: String,
        redelivered: bool,
        envelope: Envelope,
    },
}

/// Per-connection channel capacity before drop-oldest kicks in.
const SESSION_CHANNEL_CAPACITY: usize = 256;

/// Registry of live sessions, process-local.
pub struct SessionRegistry {
    sessions: DashMap<Did, broadcast::Sender<SessionFrame>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Attach a connection for `did`, returning its frame receiver.
    pub fn subscribe(&self, did: &Did) -> broadcast::Receiver<SessionFrame> {
        self.sessions
            .entry(did.clone())
            .or_insert_with(|| broadcast::channel(SESSION_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Live connections for `did`.
    pub fn connection_count(&self, did: &Did) -> usize {
        self.sessions
            .get(did)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Push a frame to every live connection of `did`. Returns how many
    /// connections received it; entries with no receivers are pruned.
    pub fn push_frame(&self, did: &Did, frame: SessionFrame) -> usize {
        let delivered = match self.sessions.get(did) {
            Some(tx) => tx.send(frame).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            self.sessions
                .remove_if(did, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    /// Push a notification to `did`'s sessions.
    pub fn push(&self, did: &Did, notification: Notification) -> usize {
        self.push_frame(did, SessionFrame::Notification(notification))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridges durable consumers to live sessions: one polling task per
/// connected DID, exiting when the last connection goes away.
pub struct ConsumerBridge {
    stream: Arc<dyn IntentStream>,
    registry: Arc<SessionRegistry>,
    active: DashMap<Did, ()>,
    poll_interval: Duration,
    batch_size: usize,
}

impl ConsumerBridge {
    pub fn new(stream: Arc<dyn IntentStream>, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            stream,
            registry,
            active: DashMap::new(),
            poll_interval: Duration::from_millis(500),
            batch_size: 32,
        })
    }

    #[cfg(test)]
    fn with_poll_interval(self: Arc<Self>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            stream: self.stream.clone(),
            registry: self.registry.clone(),
            active: DashMap::new(),
            poll_interval,
            batch_size: self.batch_size,
        })
    }

    /// Start (or reuse) the durable consumer task for `did`.
    pub fn ensure_consumer(self: &Arc<Self>, did: &Did) {
        if self.active.insert(did.clone(), ()).is_some() {
            return;
        }

        let bridge = Arc::clone(self);
        let did = did.clone();
        tokio::spawn(async move {
            let consumer = consumer_name(&did);
            let subject = intents_subject(&did);
            let mut ticker = tokio::time::interval(bridge.poll_interval);
            tracing::debug!(%did, "consumer bridge started");

            loop {
                ticker.tick().await;
                if bridge.registry.connection_count(&did) == 0 {
                    break;
                }
                match bridge
                    .stream
                    .fetch(&consumer, &subject, bridge.batch_size)
                    .await
                {
                    Ok(messages) => {
                        for message in messages {
                            bridge.registry.push_frame(
                                &did,
                                SessionFrame::Envelope {
                                    delivery_id: message.delivery_id,
                                    redelivered: message.redelivered,
                                    envelope: message.envelope,
                                },
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(%did, error = %e, "consumer fetch failed");
                    }
                }
            }

            bridge.active.remove(&did);
            tracing::debug!(%did, "consumer bridge stopped");
        });
    }

    /// Acknowledge one delivery on behalf of the client.
    pub async fn ack(&self, did: &Did, delivery_id: &str) -> Result<(), DeliveryError> {
        self.stream
            .ack(&consumer_name(did), delivery_id)
            .await
            .map_err(DeliveryError::from)
    }
}

/// Delivery fabric errors.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    #[error("delivery backend error: {0}")]
    Backend(String),
}

impl From<StreamError> for DeliveryError {
    fn from(value: StreamError) -> Self {
        match value {
            StreamError::UnknownDelivery(id) => Self::UnknownDelivery(id),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_stream::InMemoryIntentStream;
    use ainp_types::{EnvelopeId, MsgType, TaggedValue};

    fn did(s: &str) -> Did {
        Did::parse(s).unwrap()
    }

    fn notification() -> Notification {
        Notification::NewMessage {
            message_id: "m-1".to_string(),
            conversation_id: "c-1".to_string(),
            from_did: did("did:key:sender"),
        }
    }

    fn envelope(to: &Did) -> Envelope {
        Envelope {
            id: EnvelopeId::generate(),
            trace_id: "trace".to_string(),
            from_did: did("did:key:sender"),
            to_did: Some(to.clone()),
            msg_type: MsgType::Intent,
            ttl_seconds: 300,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            signature: String::new(),
            payload: TaggedValue::Null,
        }
    }

    #[tokio::test]
    async fn push_reaches_every_connection_of_the_did() {
        let registry = SessionRegistry::new();
        let alice = did("did:key:alice");
        let mut first = registry.subscribe(&alice);
        let mut second = registry.subscribe(&alice);

        assert_eq!(registry.push(&alice, notification()), 2);
        assert!(matches!(
            first.recv().await.unwrap(),
            SessionFrame::Notification(_)
        ));
        assert!(matches!(
            second.recv().await.unwrap(),
            SessionFrame::Notification(_)
        ));
    }

    #[tokio::test]
    async fn push_without_sessions_delivers_nothing() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.push(&did("did:key:nobody"), notification()), 0);
    }

    #[tokio::test]
    async fn dropped_connections_are_pruned() {
        let registry = SessionRegistry::new();
        let alice = did("did:key:alice");
        let rx = registry.subscribe(&alice);
        assert_eq!(registry.connection_count(&alice), 1);

        drop(rx);
        assert_eq!(registry.connection_count(&alice), 0);
        // A push with no receivers cleans the entry.
        registry.push(&alice, notification());
        assert!(registry.sessions.get(&alice).is_none());
    }

    #[tokio::test]
    async fn bridge_forwards_stream_envelopes_to_sessions() {
        let stream: Arc<dyn IntentStream> = Arc::new(InMemoryIntentStream::default());
        let registry = Arc::new(SessionRegistry::new());
        let bridge = ConsumerBridge::new(stream.clone(), registry.clone())
            .with_poll_interval(Duration::from_millis(10));

        let bob = did("did:key:bob");
        let mut rx = registry.subscribe(&bob);
        bridge.ensure_consumer(&bob);

        let env = envelope(&bob);
        stream
            .publish(&intents_subject(&bob), &env)
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("bridge delivers within the poll window")
            .unwrap();
        match frame {
            SessionFrame::Envelope {
                delivery_id,
                envelope,
                ..
            } => {
                assert_eq!(envelope.id, env.id);
                bridge.ack(&bob, &delivery_id).await.unwrap();
            }
            other => panic!("expected an envelope frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ack_of_unknown_delivery_is_typed() {
        let stream: Arc<dyn IntentStream> = Arc::new(InMemoryIntentStream::default());
        let registry = Arc::new(SessionRegistry::new());
        let bridge = ConsumerBridge::new(stream, registry);
        assert!(matches!(
            bridge.ack(&did("did:key:bob"), "missing").await,
            Err(DeliveryError::UnknownDelivery(_))
        ));
    }
}
