use crate::{Did, TaggedValue};
use serde::{Deserialize, Serialize};

/// Sender-scoped envelope identifier. Unique per `(sender, id)` inside the
/// replay window.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub String);

impl EnvelopeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed intent kinds carried by envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    Discover,
    DiscoverResult,
    Negotiate,
    Intent,
    Result,
    Notification,
    EmailMessage,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::DiscoverResult => "DISCOVER_RESULT",
            Self::Negotiate => "NEGOTIATE",
            Self::Intent => "INTENT",
            Self::Result => "RESULT",
            Self::Notification => "NOTIFICATION",
            Self::EmailMessage => "EMAIL_MESSAGE",
        }
    }
}

/// The signed wire unit exchanged between agents.
///
/// `to_did` absent means broadcast: the broker selects recipients via
/// semantic discovery and rewrites `to_did` before publishing per recipient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub trace_id: String,
    pub from_did: Did,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_did: Option<Did>,
    pub msg_type: MsgType,
    pub ttl_seconds: u64,
    pub timestamp_ms: i64,
    pub signature: String,
    #[serde(default)]
    pub payload: TaggedValue,
}

impl Envelope {
    /// True when `now` is past `timestamp + ttl`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.timestamp_ms > (self.ttl_seconds as i64).saturating_mul(1000)
    }

    /// Conversation identifier: the trace id groups a thread of envelopes.
    pub fn conversation_id(&self) -> &str {
        &self.trace_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            id: EnvelopeId("e-1".to_string()),
            trace_id: "t-1".to_string(),
            from_did: Did::parse("did:key:aa").unwrap(),
            to_did: None,
            msg_type: MsgType::Intent,
            ttl_seconds: 60,
            timestamp_ms: 1_000_000,
            signature: String::new(),
            payload: TaggedValue::Null,
        }
    }

    #[test]
    fn expiry_is_ttl_after_timestamp() {
        let env = sample();
        assert!(!env.is_expired(1_000_000 + 60_000));
        assert!(env.is_expired(1_000_000 + 60_001));
    }

    #[test]
    fn msg_type_serializes_screaming_snake() {
        let json = serde_json::to_string(&MsgType::EmailMessage).unwrap();
        assert_eq!(json, r#""EMAIL_MESSAGE""#);
        assert_eq!(MsgType::DiscoverResult.as_str(), "DISCOVER_RESULT");
    }

    #[test]
    fn absent_recipient_is_omitted_on_the_wire() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("to_did").is_none());
    }
}
