//! In-memory durable stream: the deterministic reference backend.
//!
//! Carries the production semantics — dedupe window, retention, ack
//! visibility, durable cursors — without external infrastructure, so the
//! router and delivery fabric are testable end to end.

use crate::{
    IntentStream, PublishAck, StreamConfig, StreamError, StreamMessage, StreamResult,
};
use ainp_types::Envelope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

struct StoredMessage {
    sequence: u64,
    envelope: Envelope,
    published_at: DateTime<Utc>,
}

struct PendingDelivery {
    sequence: u64,
    delivered_at: DateTime<Utc>,
}

#[derive(Default)]
struct ConsumerState {
    /// Next sequence this consumer has not yet seen.
    cursor: u64,
    /// Delivered but unacked, keyed by delivery id.
    pending: HashMap<String, PendingDelivery>,
}

#[derive(Default)]
struct Inner {
    subjects: HashMap<String, Vec<StoredMessage>>,
    /// Durable consumer state keyed by `(consumer, subject)`.
    consumers: HashMap<(String, String), ConsumerState>,
    /// Publish dedupe: `(sender, envelope id)` → publish time.
    dedupe: HashMap<(String, String), DateTime<Utc>>,
    next_sequence: u64,
}

/// In-memory durable stream adapter.
pub struct InMemoryIntentStream {
    config: StreamConfig,
    inner: Mutex<Inner>,
}

impl InMemoryIntentStream {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> StreamResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StreamError::Backend("stream lock poisoned".to_string()))
    }
}

impl Default for InMemoryIntentStream {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

#[async_trait]
impl IntentStream for InMemoryIntentStream {
    async fn publish(&self, subject: &str, envelope: &Envelope) -> StreamResult<PublishAck> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        let dedupe_key = (envelope.from_did.to_string(), envelope.id.0.clone());
        inner
            .dedupe
            .retain(|_, published| (now - *published).to_std().unwrap_or_default() < self.config.dedupe_window);
        if let Some(first_published) = inner.dedupe.get(&dedupe_key) {
            let age = (now - *first_published).to_std().unwrap_or_default();
            if age < self.config.dedupe_window {
                return Ok(PublishAck {
                    sequence: 0,
                    duplicate: true,
                });
            }
        }
        inner.dedupe.insert(dedupe_key, now);

        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        let retention = self.config.retention;
        let messages = inner.subjects.entry(subject.to_string()).or_default();
        messages.retain(|m| (now - m.published_at).to_std().unwrap_or_default() < retention);
        messages.push(StoredMessage {
            sequence,
            envelope: envelope.clone(),
            published_at: now,
        });

        Ok(PublishAck {
            sequence,
            duplicate: false,
        })
    }

    async fn fetch(
        &self,
        consumer: &str,
        subject: &str,
        max: usize,
    ) -> StreamResult<Vec<StreamMessage>> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let ack_wait = self.config.ack_wait;

        // Snapshot what redelivery and new delivery need before touching
        // the consumer entry, so the borrows stay disjoint.
        let stored: Vec<(u64, Envelope, DateTime<Utc>)> = inner
            .subjects
            .get(subject)
            .map(|msgs| {
                msgs.iter()
                    .map(|m| (m.sequence, m.envelope.clone(), m.published_at))
                    .collect()
            })
            .unwrap_or_default();

        let state = inner
            .consumers
            .entry((consumer.to_string(), subject.to_string()))
            .or_default();

        let mut out = Vec::new();

        // Replay deliveries whose ack window elapsed.
        let expired: Vec<(String, u64)> = state
            .pending
            .iter()
            .filter(|(_, p)| (now - p.delivered_at).to_std().unwrap_or_default() >= ack_wait)
            .map(|(id, p)| (id.clone(), p.sequence))
            .collect();
        for (old_delivery_id, sequence) in expired {
            if out.len() >= max {
                break;
            }
            state.pending.remove(&old_delivery_id);
            if let Some((seq, envelope, published_at)) =
                stored.iter().find(|(seq, _, _)| *seq == sequence).cloned()
            {
                let delivery_id = uuid::Uuid::new_v4().to_string();
                state.pending.insert(
                    delivery_id.clone(),
                    PendingDelivery {
                        sequence: seq,
                        delivered_at: now,
                    },
                );
                tracing::debug!(consumer, subject, sequence = seq, "redelivering unacked message");
                out.push(StreamMessage {
                    delivery_id,
                    subject: subject.to_string(),
                    sequence: seq,
                    envelope,
                    published_at,
                    redelivered: true,
                });
            }
        }

        // Then new messages past the durable cursor.
        for (sequence, envelope, published_at) in stored.iter() {
            if out.len() >= max {
                break;
            }
            if *sequence <= state.cursor {
                continue;
            }
            state.cursor = *sequence;
            let delivery_id = uuid::Uuid::new_v4().to_string();
            state.pending.insert(
                delivery_id.clone(),
                PendingDelivery {
                    sequence: *sequence,
                    delivered_at: now,
                },
            );
            out.push(StreamMessage {
                delivery_id,
                subject: subject.to_string(),
                sequence: *sequence,
                envelope: envelope.clone(),
                published_at: *published_at,
                redelivered: false,
            });
        }

        Ok(out)
    }

    async fn ack(&self, consumer: &str, delivery_id: &str) -> StreamResult<()> {
        let mut inner = self.lock()?;
        for ((name, _), state) in inner.consumers.iter_mut() {
            if name == consumer && state.pending.remove(delivery_id).is_some() {
                return Ok(());
            }
        }
        Err(StreamError::UnknownDelivery(delivery_id.to_string()))
    }

    async fn ping(&self) -> StreamResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{consumer_name, intents_subject};
    use ainp_types::{Did, EnvelopeId, MsgType, TaggedValue};
    use std::time::Duration;

    fn envelope(from: &Did, id: &str) -> Envelope {
        Envelope {
            id: EnvelopeId(id.to_string()),
            trace_id: "trace".to_string(),
            from_did: from.clone(),
            to_did: None,
            msg_type: MsgType::Intent,
            ttl_seconds: 300,
            timestamp_ms: Utc::now().timestamp_millis(),
            signature: String::new(),
            payload: TaggedValue::Null,
        }
    }

    fn fast_config() -> StreamConfig {
        StreamConfig {
            dedupe_window: Duration::from_secs(120),
            retention: Duration::from_secs(3600),
            ack_wait: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn publish_fetch_ack_flow() {
        let stream = InMemoryIntentStream::default();
        let sender = Did::parse("did:key:aa").unwrap();
        let recipient = Did::parse("did:key:bb").unwrap();
        let subject = intents_subject(&recipient);
        let consumer = consumer_name(&recipient);

        let ack = stream.publish(&subject, &envelope(&sender, "e-1")).await.unwrap();
        assert!(!ack.duplicate);

        let messages = stream.fetch(&consumer, &subject, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].redelivered);

        stream.ack(&consumer, &messages[0].delivery_id).await.unwrap();
        let after = stream.fetch(&consumer, &subject, 10).await.unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn duplicate_publish_inside_window_is_suppressed() {
        let stream = InMemoryIntentStream::default();
        let sender = Did::parse("did:key:aa").unwrap();
        let recipient = Did::parse("did:key:bb").unwrap();
        let subject = intents_subject(&recipient);

        let first = stream.publish(&subject, &envelope(&sender, "e-1")).await.unwrap();
        let second = stream.publish(&subject, &envelope(&sender, "e-1")).await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);

        let messages = stream
            .fetch(&consumer_name(&recipient), &subject, 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn unacked_delivery_replays_after_ack_window() {
        let stream = InMemoryIntentStream::new(fast_config());
        let sender = Did::parse("did:key:aa").unwrap();
        let recipient = Did::parse("did:key:bb").unwrap();
        let subject = intents_subject(&recipient);
        let consumer = consumer_name(&recipient);

        stream.publish(&subject, &envelope(&sender, "e-1")).await.unwrap();
        let first = stream.fetch(&consumer, &subject, 10).await.unwrap();
        assert_eq!(first.len(), 1);

        // Not acked: replays once the visibility window elapses.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let replayed = stream.fetch(&consumer, &subject, 10).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert!(replayed[0].redelivered);
        assert_ne!(replayed[0].delivery_id, first[0].delivery_id);
    }

    #[tokio::test]
    async fn consumers_are_durable_per_recipient() {
        let stream = InMemoryIntentStream::default();
        let sender = Did::parse("did:key:aa").unwrap();
        let alice = Did::parse("did:key:a1").unwrap();
        let bob = Did::parse("did:key:b1").unwrap();

        stream
            .publish(&intents_subject(&alice), &envelope(&sender, "e-1"))
            .await
            .unwrap();
        stream
            .publish(&intents_subject(&bob), &envelope(&sender, "e-2"))
            .await
            .unwrap();

        let alice_msgs = stream
            .fetch(&consumer_name(&alice), &intents_subject(&alice), 10)
            .await
            .unwrap();
        assert_eq!(alice_msgs.len(), 1);
        assert_eq!(alice_msgs[0].envelope.id.0, "e-1");

        let bob_msgs = stream
            .fetch(&consumer_name(&bob), &intents_subject(&bob), 10)
            .await
            .unwrap();
        assert_eq!(bob_msgs.len(), 1);
        assert_eq!(bob_msgs[0].envelope.id.0, "e-2");
    }

    #[tokio::test]
    async fn ack_of_unknown_delivery_errors() {
        let stream = InMemoryIntentStream::default();
        let err = stream.ack("agent_x", "nope").await.expect_err("must fail");
        assert!(matches!(err, StreamError::UnknownDelivery(_)));
    }
}
