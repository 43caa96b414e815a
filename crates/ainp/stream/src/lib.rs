//! Durable intent stream adapter.
//!
//! Three logical streams carry broker traffic: `intents.{did}`,
//! `negotiations.{id}`, and `results.{did}`. Delivery is at-least-once:
//! per-sender publish dedupe inside a rolling window, explicit acks with a
//! visibility timeout, and a durable consumer per recipient. The trait is
//! the mount point for external stream infrastructure; the in-memory
//! implementation carries the full semantics for tests and development.

#![deny(unsafe_code)]

mod memory;

pub use memory::InMemoryIntentStream;

use ainp_types::{Did, Envelope};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Subject for intents addressed to one recipient.
pub fn intents_subject(did: &Did) -> String {
    format!("intents.{did}")
}

/// Subject for one negotiation's event feed.
pub fn negotiations_subject(negotiation_id: &str) -> String {
    format!("negotiations.{negotiation_id}")
}

/// Subject for results addressed to one recipient.
pub fn results_subject(did: &Did) -> String {
    format!("results.{did}")
}

/// Durable consumer name for a recipient.
pub fn consumer_name(did: &Did) -> String {
    format!("agent_{did}")
}

/// Stream behavior knobs.
#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    /// Per-sender publish dedupe window.
    pub dedupe_window: Duration,
    /// How long published messages are retained.
    pub retention: Duration,
    /// Visibility timeout before an unacked delivery replays.
    pub ack_wait: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            dedupe_window: Duration::from_secs(120),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            ack_wait: Duration::from_secs(30),
        }
    }
}

/// Publish acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishAck {
    pub sequence: u64,
    /// True when the publish was suppressed by the dedupe window.
    pub duplicate: bool,
}

/// A message handed to a consumer. `delivery_id` is unique per delivery
/// attempt and is what `ack` takes.
#[derive(Clone, Debug)]
pub struct StreamMessage {
    pub delivery_id: String,
    pub subject: String,
    pub sequence: u64,
    pub envelope: Envelope,
    pub published_at: chrono::DateTime<chrono::Utc>,
    pub redelivered: bool,
}

/// The durable stream surface.
#[async_trait]
pub trait IntentStream: Send + Sync {
    /// Publish an envelope to a subject. Stream creation is idempotent;
    /// duplicates inside the dedupe window are acknowledged but not stored
    /// twice.
    async fn publish(&self, subject: &str, envelope: &Envelope) -> StreamResult<PublishAck>;

    /// Fetch up to `max` messages for a durable consumer on a subject.
    /// Unacked deliveries past the ack window are replayed first.
    async fn fetch(
        &self,
        consumer: &str,
        subject: &str,
        max: usize,
    ) -> StreamResult<Vec<StreamMessage>>;

    /// Acknowledge one delivery.
    async fn ack(&self, consumer: &str, delivery_id: &str) -> StreamResult<()>;

    /// Liveness probe for the readiness endpoint.
    async fn ping(&self) -> StreamResult<()>;
}

/// Stream-layer errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream unreachable: {0}")]
    Unavailable(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    #[error("stream backend error: {0}")]
    Backend(String),
}
