use ainp_types::{
    Did, IncentiveSplit, MsgType, NegotiationState, Proposal, ReputationDimensions, Round,
    TaggedValue, TrustVector,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered agent. The DID is unique and immutable; the public key is
/// required for `did:web` identities (a `did:key` embeds its own).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRecord {
    pub did: Did,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_hex: Option<String>,
    pub ttl_seconds: u64,
    /// Rolling usefulness score maintained by the aggregator's refresh job.
    pub usefulness_cached: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usefulness_updated_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One capability: a described, embedded, tagged thing an agent can do.
/// `(agent, description)` is unique; re-registration replaces the set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub id: Uuid,
    pub agent_did: Did,
    pub description: String,
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A vector-search hit joined with the owning agent's trust and cached
/// usefulness, ready for combined ranking.
#[derive(Clone, Debug)]
pub struct CapabilitySearchHit {
    pub capability: CapabilityRecord,
    pub similarity: f64,
    pub trust: Option<TrustRecord>,
    pub usefulness_cached: f64,
}

/// Per-agent trust with decay applied on read.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrustRecord {
    pub agent_did: Did,
    pub vector: TrustVector,
    pub decay_rate: f64,
    pub updated_at: DateTime<Utc>,
}

impl TrustRecord {
    /// Aggregate score with decay for the time elapsed since last update.
    pub fn decayed_score(&self, now: DateTime<Utc>) -> f64 {
        let days = (now - self.updated_at).num_seconds() as f64 / 86_400.0;
        self.vector.decayed_score(self.decay_rate, days)
    }
}

/// A persisted mailbox copy of an envelope, one per recipient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub owner_did: Did,
    pub envelope_id: String,
    pub from_did: Did,
    pub conversation_id: String,
    pub msg_type: MsgType,
    pub payload: TaggedValue,
    pub read: bool,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an idempotent insert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreOutcome {
    pub inserted: bool,
}

/// Derived thread aggregate, updated atomically with message inserts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub conversation_id: String,
    pub owner_did: Did,
    pub participants: Vec<Did>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: i64,
    pub unread_count: i64,
}

/// Keyset cursor for inbox pagination: strictly older than this position.
#[derive(Clone, Copy, Debug)]
pub struct InboxCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

/// Inbox listing parameters.
#[derive(Clone, Debug, Default)]
pub struct InboxQuery {
    pub limit: usize,
    pub cursor: Option<InboxCursor>,
    pub label: Option<String>,
    pub unread_only: bool,
}

/// Consent on a contact edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentState {
    Unknown,
    Allowed,
    Blocked,
}

impl ConsentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
        }
    }
}

/// One `(owner, peer)` contact edge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContactRecord {
    pub owner_did: Did,
    pub peer_did: Did,
    pub first_seen_at: DateTime<Utc>,
    pub interaction_count: i64,
    pub consent: ConsentState,
}

/// A negotiation session. Sink states are never mutated again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NegotiationRecord {
    pub id: String,
    pub intent_id: String,
    pub initiator_did: Did,
    pub responder_did: Did,
    pub state: NegotiationState,
    pub max_rounds: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rounds: Vec<Round>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_proposal: Option<Proposal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_proposal: Option<Proposal>,
    pub convergence_score: f64,
    pub incentive_split: IncentiveSplit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved_credits: Option<i64>,
}

/// Negotiation listing filter.
#[derive(Clone, Debug, Default)]
pub struct NegotiationFilter {
    pub agent_did: Option<Did>,
    pub state: Option<NegotiationState>,
}

/// Credit account snapshot. `balance` excludes `reserved`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountRecord {
    pub owner_did: Did,
    pub balance: i64,
    pub reserved: i64,
    pub lifetime_earned: i64,
    pub lifetime_spent: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Journal entry kinds. The journal is append-only; signed deltas
/// reconcile to the account snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerEntryType {
    Deposit,
    Reserve,
    Release,
    Earn,
    Spend,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Reserve => "reserve",
            Self::Release => "release",
            Self::Earn => "earn",
            Self::Spend => "spend",
        }
    }
}

/// One append-only journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntryRecord {
    pub id: Uuid,
    pub owner_did: Did,
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Payment request lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Pending,
    Paid,
    Expired,
    Failed,
}

/// A pending external payment that deposits credits once the provider
/// webhook confirms it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRequestRecord {
    pub id: String,
    pub owner_did: Did,
    pub amount_atomic: i64,
    pub currency: String,
    pub method: String,
    pub state: PaymentState,
    pub payment_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Per-agent reputation dimensions updated by receipt finalization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub agent_did: Did,
    pub dimensions: ReputationDimensions,
    pub updated_at: DateTime<Utc>,
}
