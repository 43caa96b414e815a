use crate::model::{
    AccountRecord, AgentRecord, CapabilityRecord, CapabilitySearchHit, ConsentState,
    ContactRecord, InboxQuery, LedgerEntryRecord, MessageRecord, NegotiationFilter,
    NegotiationRecord, PaymentRequestRecord, PaymentState, ReputationRecord, StoreOutcome,
    ThreadRecord, TrustRecord,
};
use crate::StorageResult;
use ainp_types::{Attestation, Did, NegotiationState, TaskReceipt, UsefulnessProof};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

/// Backend liveness probe for the readiness endpoint.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn ping(&self) -> StorageResult<()>;
}

/// Agents, capabilities, and trust records.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Insert or update an agent. The DID is the identity; re-registration
    /// refreshes everything else.
    async fn upsert_agent(&self, agent: AgentRecord) -> StorageResult<()>;

    async fn get_agent(&self, did: &Did) -> StorageResult<Option<AgentRecord>>;

    /// Replace the agent's capability set to match its latest address.
    async fn replace_capabilities(
        &self,
        did: &Did,
        capabilities: Vec<CapabilityRecord>,
    ) -> StorageResult<()>;

    async fn list_capabilities(&self, did: &Did) -> StorageResult<Vec<CapabilityRecord>>;

    /// Nearest-neighbor search over capability embeddings, left-joined with
    /// each owner's trust record and cached usefulness score.
    async fn search_capabilities(
        &self,
        embedding: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> StorageResult<Vec<CapabilitySearchHit>>;

    async fn get_trust(&self, did: &Did) -> StorageResult<Option<TrustRecord>>;

    async fn upsert_trust(&self, trust: TrustRecord) -> StorageResult<()>;

    /// Write the cached usefulness score the refresh job computed.
    async fn set_cached_usefulness(
        &self,
        did: &Did,
        score: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Agents ordered by cached usefulness, best first. Committee selection
    /// draws from this.
    async fn list_agents_by_usefulness(&self, limit: usize) -> StorageResult<Vec<AgentRecord>>;
}

/// Mailbox messages and thread aggregates.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Persist one recipient's copy of an envelope and update the thread
    /// aggregate in the same transaction. Idempotent on
    /// `(owner_did, envelope_id)`: replays return `inserted: false` and
    /// leave the aggregate untouched.
    async fn store_message(&self, message: MessageRecord) -> StorageResult<StoreOutcome>;

    /// Keyset-paginated inbox, newest first (`created_at DESC, id DESC`).
    async fn list_inbox(&self, owner: &Did, query: InboxQuery)
        -> StorageResult<Vec<MessageRecord>>;

    async fn get_message(
        &self,
        owner: &Did,
        message_id: &uuid::Uuid,
    ) -> StorageResult<Option<MessageRecord>>;

    async fn get_thread(
        &self,
        owner: &Did,
        conversation_id: &str,
    ) -> StorageResult<Option<ThreadRecord>>;

    async fn list_thread_messages(
        &self,
        owner: &Did,
        conversation_id: &str,
        window: QueryWindow,
    ) -> StorageResult<Vec<MessageRecord>>;

    /// Set the read flag; adjusts the thread's unread count atomically.
    /// Idempotent: setting the current value changes nothing.
    async fn set_read(
        &self,
        owner: &Did,
        message_id: &uuid::Uuid,
        read: bool,
    ) -> StorageResult<MessageRecord>;

    /// Apply label set union/difference.
    async fn update_labels(
        &self,
        owner: &Did,
        message_id: &uuid::Uuid,
        add: &[String],
        remove: &[String],
    ) -> StorageResult<MessageRecord>;
}

/// Contact edges with consent.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get_contact(&self, owner: &Did, peer: &Did) -> StorageResult<Option<ContactRecord>>;

    /// Create the edge on first interaction (`consent = unknown`), else
    /// increment the interaction counter.
    async fn record_interaction(
        &self,
        owner: &Did,
        peer: &Did,
        at: DateTime<Utc>,
    ) -> StorageResult<ContactRecord>;

    async fn set_consent(
        &self,
        owner: &Did,
        peer: &Did,
        consent: ConsentState,
    ) -> StorageResult<ContactRecord>;
}

/// Negotiation sessions. Writers go through a compare-and-swap on the
/// session state so concurrent transitions serialize (first writer wins).
#[async_trait]
pub trait NegotiationStore: Send + Sync {
    async fn insert_negotiation(&self, negotiation: NegotiationRecord) -> StorageResult<()>;

    async fn get_negotiation(&self, id: &str) -> StorageResult<Option<NegotiationRecord>>;

    /// Persist the updated session only if the stored state still equals
    /// `expected_state`. A mismatch is an invariant violation surfaced to
    /// the caller as a lost race.
    async fn update_negotiation(
        &self,
        negotiation: NegotiationRecord,
        expected_state: NegotiationState,
    ) -> StorageResult<()>;

    async fn list_negotiations(
        &self,
        filter: NegotiationFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<NegotiationRecord>>;

    /// Non-sink sessions whose deadline has passed.
    async fn list_expired(&self, now: DateTime<Utc>) -> StorageResult<Vec<NegotiationRecord>>;
}

/// Credit accounts and the append-only journal. Every mutation is atomic
/// per account and appends its journal entry in the same transaction.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Idempotent: a second create for the same DID is a no-op.
    async fn create_account(&self, did: &Did, initial_balance: i64) -> StorageResult<AccountRecord>;

    async fn get_account(&self, did: &Did) -> StorageResult<Option<AccountRecord>>;

    async fn deposit(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord>;

    /// Move `amount` from balance into reserve. Fails when balance is
    /// insufficient.
    async fn reserve(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord>;

    /// Release `reserved_amount` from reserve, spending `spend_amount` of
    /// it and refunding the rest to balance.
    async fn release(
        &self,
        did: &Did,
        reserved_amount: i64,
        spend_amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord>;

    async fn earn(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
        proof_id: Option<&str>,
    ) -> StorageResult<AccountRecord>;

    /// Direct spend from balance (postage). Fails when balance is
    /// insufficient.
    async fn charge(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord>;

    async fn list_entries(
        &self,
        did: &Did,
        window: QueryWindow,
    ) -> StorageResult<Vec<LedgerEntryRecord>>;
}

/// Payment requests.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn insert_payment_request(&self, request: PaymentRequestRecord) -> StorageResult<()>;

    async fn get_payment_request(&self, id: &str)
        -> StorageResult<Option<PaymentRequestRecord>>;

    /// State transition with compare-and-swap on the current state.
    async fn transition_payment(
        &self,
        id: &str,
        expected: PaymentState,
        to: PaymentState,
    ) -> StorageResult<PaymentRequestRecord>;

    async fn list_expired_payments(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<PaymentRequestRecord>>;
}

/// Usefulness proofs: append-only once accepted.
#[async_trait]
pub trait ProofStore: Send + Sync {
    async fn insert_proof(&self, proof: UsefulnessProof) -> StorageResult<()>;

    async fn list_proofs_since(
        &self,
        did: &Did,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<UsefulnessProof>>;

    /// DIDs of every agent with at least one proof.
    async fn list_agents_with_proofs(&self) -> StorageResult<Vec<Did>>;
}

/// Task receipts, attestations, and reputation.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    async fn insert_receipt(&self, receipt: TaskReceipt) -> StorageResult<()>;

    async fn get_receipt(&self, id: &str) -> StorageResult<Option<TaskReceipt>>;

    /// Append one attestation. A second attestation by the same DID on the
    /// same receipt is a conflict.
    async fn add_attestation(
        &self,
        receipt_id: &str,
        attestation: Attestation,
    ) -> StorageResult<TaskReceipt>;

    /// Transition pending → finalized exactly once. A second finalize is a
    /// no-op returning the stored receipt.
    async fn finalize_receipt(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<TaskReceipt>;

    async fn list_pending_receipts(&self, window: QueryWindow)
        -> StorageResult<Vec<TaskReceipt>>;

    async fn get_reputation(&self, did: &Did) -> StorageResult<Option<ReputationRecord>>;

    async fn upsert_reputation(&self, reputation: ReputationRecord) -> StorageResult<()>;
}

/// Unified storage bundle used by broker surfaces.
pub trait BrokerStorage:
    AgentStore
    + MailboxStore
    + ContactStore
    + NegotiationStore
    + AccountStore
    + PaymentStore
    + ProofStore
    + ReceiptStore
    + Probe
    + Send
    + Sync
{
}

impl<T> BrokerStorage for T where
    T: AgentStore
        + MailboxStore
        + ContactStore
        + NegotiationStore
        + AccountStore
        + PaymentStore
        + ProofStore
        + ReceiptStore
        + Probe
        + Send
        + Sync
{
}
