//! In-memory reference implementation of the broker storage traits.
//!
//! Deterministic and test-friendly. Collections that must change together
//! (messages with thread aggregates, accounts with journal entries) share a
//! lock, so the same-transaction guarantees of the Postgres backend hold
//! here too.

use crate::model::{
    AccountRecord, AgentRecord, CapabilityRecord, CapabilitySearchHit, ConsentState,
    ContactRecord, InboxQuery, LedgerEntryRecord, LedgerEntryType, MessageRecord,
    NegotiationFilter, NegotiationRecord, PaymentRequestRecord, PaymentState,
    ReputationRecord, StoreOutcome, ThreadRecord, TrustRecord,
};
use crate::traits::{
    AccountStore, AgentStore, ContactStore, MailboxStore, NegotiationStore, PaymentStore,
    Probe, ProofStore, QueryWindow, ReceiptStore,
};
use crate::{StorageError, StorageResult};
use ainp_types::{
    Attestation, Did, NegotiationState, ReceiptStatus, TaskReceipt, UsefulnessProof,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct AgentsState {
    agents: HashMap<Did, AgentRecord>,
    capabilities: HashMap<Did, Vec<CapabilityRecord>>,
    trust: HashMap<Did, TrustRecord>,
}

#[derive(Default)]
struct MailboxState {
    /// Keyed by `(owner, message id)`.
    messages: HashMap<(Did, Uuid), MessageRecord>,
    /// Keyed by `(conversation, owner)`.
    threads: HashMap<(String, Did), ThreadRecord>,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<Did, AccountRecord>,
    entries: Vec<LedgerEntryRecord>,
}

#[derive(Default)]
struct ReceiptState {
    receipts: HashMap<String, TaskReceipt>,
    reputation: HashMap<Did, ReputationRecord>,
}

/// In-memory broker storage adapter.
#[derive(Default)]
pub struct InMemoryBrokerStorage {
    agents: Mutex<AgentsState>,
    mailbox: Mutex<MailboxState>,
    contacts: Mutex<HashMap<(Did, Did), ContactRecord>>,
    negotiations: Mutex<HashMap<String, NegotiationRecord>>,
    ledger: Mutex<LedgerState>,
    payments: Mutex<HashMap<String, PaymentRequestRecord>>,
    proofs: Mutex<Vec<UsefulnessProof>>,
    receipts: Mutex<ReceiptState>,
}

impl InMemoryBrokerStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> StorageResult<MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|_| StorageError::Backend(format!("{what} lock poisoned")))
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn apply_window<T>(mut items: Vec<T>, window: QueryWindow) -> Vec<T> {
    if window.offset > 0 {
        items = items.into_iter().skip(window.offset).collect();
    }
    if window.limit > 0 {
        items.truncate(window.limit);
    }
    items
}

#[async_trait]
impl AgentStore for InMemoryBrokerStorage {
    async fn upsert_agent(&self, agent: AgentRecord) -> StorageResult<()> {
        let mut state = Self::lock(&self.agents, "agents")?;
        let merged = match state.agents.get(&agent.did) {
            Some(existing) => AgentRecord {
                registered_at: existing.registered_at,
                usefulness_cached: existing.usefulness_cached,
                usefulness_updated_at: existing.usefulness_updated_at,
                ..agent
            },
            None => agent,
        };
        state.agents.insert(merged.did.clone(), merged);
        Ok(())
    }

    async fn get_agent(&self, did: &Did) -> StorageResult<Option<AgentRecord>> {
        Ok(Self::lock(&self.agents, "agents")?.agents.get(did).cloned())
    }

    async fn replace_capabilities(
        &self,
        did: &Did,
        capabilities: Vec<CapabilityRecord>,
    ) -> StorageResult<()> {
        let mut state = Self::lock(&self.agents, "agents")?;
        if !state.agents.contains_key(did) {
            return Err(StorageError::NotFound(format!("agent {did}")));
        }
        state.capabilities.insert(did.clone(), capabilities);
        Ok(())
    }

    async fn list_capabilities(&self, did: &Did) -> StorageResult<Vec<CapabilityRecord>> {
        Ok(Self::lock(&self.agents, "agents")?
            .capabilities
            .get(did)
            .cloned()
            .unwrap_or_default())
    }

    async fn search_capabilities(
        &self,
        embedding: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> StorageResult<Vec<CapabilitySearchHit>> {
        let state = Self::lock(&self.agents, "agents")?;
        let mut hits: Vec<CapabilitySearchHit> = state
            .capabilities
            .values()
            .flatten()
            .filter_map(|capability| {
                let similarity = cosine_similarity(embedding, &capability.embedding);
                if similarity < min_similarity {
                    return None;
                }
                Some(CapabilitySearchHit {
                    capability: capability.clone(),
                    similarity,
                    trust: state.trust.get(&capability.agent_did).cloned(),
                    usefulness_cached: state
                        .agents
                        .get(&capability.agent_did)
                        .map(|a| a.usefulness_cached)
                        .unwrap_or(0.0),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get_trust(&self, did: &Did) -> StorageResult<Option<TrustRecord>> {
        Ok(Self::lock(&self.agents, "agents")?.trust.get(did).cloned())
    }

    async fn upsert_trust(&self, trust: TrustRecord) -> StorageResult<()> {
        Self::lock(&self.agents, "agents")?
            .trust
            .insert(trust.agent_did.clone(), trust);
        Ok(())
    }

    async fn set_cached_usefulness(
        &self,
        did: &Did,
        score: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut state = Self::lock(&self.agents, "agents")?;
        let agent = state
            .agents
            .get_mut(did)
            .ok_or_else(|| StorageError::NotFound(format!("agent {did}")))?;
        agent.usefulness_cached = score;
        agent.usefulness_updated_at = Some(at);
        Ok(())
    }

    async fn list_agents_by_usefulness(&self, limit: usize) -> StorageResult<Vec<AgentRecord>> {
        let state = Self::lock(&self.agents, "agents")?;
        let mut agents: Vec<AgentRecord> = state.agents.values().cloned().collect();
        agents.sort_by(|a, b| {
            b.usefulness_cached
                .partial_cmp(&a.usefulness_cached)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.did.cmp(&b.did))
        });
        agents.truncate(limit);
        Ok(agents)
    }
}

#[async_trait]
impl MailboxStore for InMemoryBrokerStorage {
    async fn store_message(&self, message: MessageRecord) -> StorageResult<StoreOutcome> {
        let mut state = Self::lock(&self.mailbox, "mailbox")?;

        let duplicate = state.messages.values().any(|m| {
            m.owner_did == message.owner_did && m.envelope_id == message.envelope_id
        });
        if duplicate {
            return Ok(StoreOutcome { inserted: false });
        }

        let thread_key = (message.conversation_id.clone(), message.owner_did.clone());
        let thread = state
            .threads
            .entry(thread_key)
            .or_insert_with(|| ThreadRecord {
                conversation_id: message.conversation_id.clone(),
                owner_did: message.owner_did.clone(),
                participants: Vec::new(),
                last_message_at: message.created_at,
                message_count: 0,
                unread_count: 0,
            });
        thread.message_count += 1;
        if !message.read {
            thread.unread_count += 1;
        }
        if thread.last_message_at < message.created_at {
            thread.last_message_at = message.created_at;
        }
        for participant in [&message.from_did, &message.owner_did] {
            if !thread.participants.contains(participant) {
                thread.participants.push(participant.clone());
            }
        }

        state
            .messages
            .insert((message.owner_did.clone(), message.id), message);
        Ok(StoreOutcome { inserted: true })
    }

    async fn list_inbox(
        &self,
        owner: &Did,
        query: InboxQuery,
    ) -> StorageResult<Vec<MessageRecord>> {
        let state = Self::lock(&self.mailbox, "mailbox")?;
        let mut messages: Vec<MessageRecord> = state
            .messages
            .values()
            .filter(|m| &m.owner_did == owner)
            .filter(|m| !query.unread_only || !m.read)
            .filter(|m| {
                query
                    .label
                    .as_ref()
                    .map(|label| m.labels.contains(label))
                    .unwrap_or(true)
            })
            .filter(|m| match query.cursor {
                Some(cursor) => {
                    m.created_at < cursor.created_at
                        || (m.created_at == cursor.created_at && m.id < cursor.id)
                }
                None => true,
            })
            .cloned()
            .collect();

        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if query.limit > 0 {
            messages.truncate(query.limit);
        }
        Ok(messages)
    }

    async fn get_message(
        &self,
        owner: &Did,
        message_id: &Uuid,
    ) -> StorageResult<Option<MessageRecord>> {
        Ok(Self::lock(&self.mailbox, "mailbox")?
            .messages
            .get(&(owner.clone(), *message_id))
            .cloned())
    }

    async fn get_thread(
        &self,
        owner: &Did,
        conversation_id: &str,
    ) -> StorageResult<Option<ThreadRecord>> {
        Ok(Self::lock(&self.mailbox, "mailbox")?
            .threads
            .get(&(conversation_id.to_string(), owner.clone()))
            .cloned())
    }

    async fn list_thread_messages(
        &self,
        owner: &Did,
        conversation_id: &str,
        window: QueryWindow,
    ) -> StorageResult<Vec<MessageRecord>> {
        let state = Self::lock(&self.mailbox, "mailbox")?;
        let mut messages: Vec<MessageRecord> = state
            .messages
            .values()
            .filter(|m| &m.owner_did == owner && m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(apply_window(messages, window))
    }

    async fn set_read(
        &self,
        owner: &Did,
        message_id: &Uuid,
        read: bool,
    ) -> StorageResult<MessageRecord> {
        let mut state = Self::lock(&self.mailbox, "mailbox")?;
        let key = (owner.clone(), *message_id);
        let message = state
            .messages
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(format!("message {message_id}")))?;

        if message.read == read {
            return Ok(message.clone());
        }
        message.read = read;
        let updated = message.clone();

        let thread_key = (updated.conversation_id.clone(), owner.clone());
        if let Some(thread) = state.threads.get_mut(&thread_key) {
            if read {
                thread.unread_count = (thread.unread_count - 1).max(0);
            } else {
                thread.unread_count += 1;
            }
        }
        Ok(updated)
    }

    async fn update_labels(
        &self,
        owner: &Did,
        message_id: &Uuid,
        add: &[String],
        remove: &[String],
    ) -> StorageResult<MessageRecord> {
        let mut state = Self::lock(&self.mailbox, "mailbox")?;
        let message = state
            .messages
            .get_mut(&(owner.clone(), *message_id))
            .ok_or_else(|| StorageError::NotFound(format!("message {message_id}")))?;

        message.labels.retain(|l| !remove.contains(l));
        for label in add {
            if !message.labels.contains(label) {
                message.labels.push(label.clone());
            }
        }
        Ok(message.clone())
    }
}

#[async_trait]
impl ContactStore for InMemoryBrokerStorage {
    async fn get_contact(&self, owner: &Did, peer: &Did) -> StorageResult<Option<ContactRecord>> {
        Ok(Self::lock(&self.contacts, "contacts")?
            .get(&(owner.clone(), peer.clone()))
            .cloned())
    }

    async fn record_interaction(
        &self,
        owner: &Did,
        peer: &Did,
        at: DateTime<Utc>,
    ) -> StorageResult<ContactRecord> {
        let mut contacts = Self::lock(&self.contacts, "contacts")?;
        let contact = contacts
            .entry((owner.clone(), peer.clone()))
            .and_modify(|c| c.interaction_count += 1)
            .or_insert_with(|| ContactRecord {
                owner_did: owner.clone(),
                peer_did: peer.clone(),
                first_seen_at: at,
                interaction_count: 1,
                consent: ConsentState::Unknown,
            });
        Ok(contact.clone())
    }

    async fn set_consent(
        &self,
        owner: &Did,
        peer: &Did,
        consent: ConsentState,
    ) -> StorageResult<ContactRecord> {
        let mut contacts = Self::lock(&self.contacts, "contacts")?;
        let now = Utc::now();
        let contact = contacts
            .entry((owner.clone(), peer.clone()))
            .and_modify(|c| c.consent = consent)
            .or_insert_with(|| ContactRecord {
                owner_did: owner.clone(),
                peer_did: peer.clone(),
                first_seen_at: now,
                interaction_count: 0,
                consent,
            });
        Ok(contact.clone())
    }
}

#[async_trait]
impl NegotiationStore for InMemoryBrokerStorage {
    async fn insert_negotiation(&self, negotiation: NegotiationRecord) -> StorageResult<()> {
        let mut sessions = Self::lock(&self.negotiations, "negotiations")?;
        if sessions.contains_key(&negotiation.id) {
            return Err(StorageError::Conflict(format!(
                "negotiation {} already exists",
                negotiation.id
            )));
        }
        sessions.insert(negotiation.id.clone(), negotiation);
        Ok(())
    }

    async fn get_negotiation(&self, id: &str) -> StorageResult<Option<NegotiationRecord>> {
        Ok(Self::lock(&self.negotiations, "negotiations")?.get(id).cloned())
    }

    async fn update_negotiation(
        &self,
        negotiation: NegotiationRecord,
        expected_state: NegotiationState,
    ) -> StorageResult<()> {
        let mut sessions = Self::lock(&self.negotiations, "negotiations")?;
        let stored = sessions
            .get_mut(&negotiation.id)
            .ok_or_else(|| StorageError::NotFound(format!("negotiation {}", negotiation.id)))?;

        if stored.state != expected_state {
            return Err(StorageError::InvariantViolation(format!(
                "negotiation {} state changed concurrently: expected {:?}, found {:?}",
                negotiation.id, expected_state, stored.state
            )));
        }
        *stored = negotiation;
        Ok(())
    }

    async fn list_negotiations(
        &self,
        filter: NegotiationFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<NegotiationRecord>> {
        let sessions = Self::lock(&self.negotiations, "negotiations")?;
        let mut results: Vec<NegotiationRecord> = sessions
            .values()
            .filter(|n| {
                filter
                    .agent_did
                    .as_ref()
                    .map(|did| &n.initiator_did == did || &n.responder_did == did)
                    .unwrap_or(true)
            })
            .filter(|n| filter.state.map(|s| n.state == s).unwrap_or(true))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(apply_window(results, window))
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> StorageResult<Vec<NegotiationRecord>> {
        let sessions = Self::lock(&self.negotiations, "negotiations")?;
        Ok(sessions
            .values()
            .filter(|n| !n.state.is_sink() && n.expires_at <= now)
            .cloned()
            .collect())
    }
}

impl InMemoryBrokerStorage {
    fn append_entry(
        state: &mut LedgerState,
        owner: &Did,
        entry_type: LedgerEntryType,
        amount: i64,
        intent_id: Option<&str>,
        proof_id: Option<&str>,
    ) {
        state.entries.push(LedgerEntryRecord {
            id: Uuid::new_v4(),
            owner_did: owner.clone(),
            entry_type,
            amount,
            intent_id: intent_id.map(str::to_string),
            proof_id: proof_id.map(str::to_string),
            at: Utc::now(),
        });
    }

    fn account_mut<'a>(
        state: &'a mut LedgerState,
        did: &Did,
    ) -> StorageResult<&'a mut AccountRecord> {
        state
            .accounts
            .get_mut(did)
            .ok_or_else(|| StorageError::NotFound(format!("account {did}")))
    }
}

#[async_trait]
impl AccountStore for InMemoryBrokerStorage {
    async fn create_account(&self, did: &Did, initial_balance: i64) -> StorageResult<AccountRecord> {
        let mut state = Self::lock(&self.ledger, "ledger")?;
        if let Some(existing) = state.accounts.get(did) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let account = AccountRecord {
            owner_did: did.clone(),
            balance: initial_balance,
            reserved: 0,
            lifetime_earned: 0,
            lifetime_spent: 0,
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(did.clone(), account.clone());
        if initial_balance > 0 {
            Self::append_entry(
                &mut state,
                did,
                LedgerEntryType::Deposit,
                initial_balance,
                None,
                None,
            );
        }
        Ok(account)
    }

    async fn get_account(&self, did: &Did) -> StorageResult<Option<AccountRecord>> {
        Ok(Self::lock(&self.ledger, "ledger")?.accounts.get(did).cloned())
    }

    async fn deposit(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut state = Self::lock(&self.ledger, "ledger")?;
        let account = Self::account_mut(&mut state, did)?;
        account.balance += amount;
        account.updated_at = Utc::now();
        let snapshot = account.clone();
        Self::append_entry(&mut state, did, LedgerEntryType::Deposit, amount, intent_id, None);
        Ok(snapshot)
    }

    async fn reserve(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut state = Self::lock(&self.ledger, "ledger")?;
        let account = Self::account_mut(&mut state, did)?;
        if account.balance < amount {
            return Err(StorageError::InsufficientBalance {
                requested: amount,
                available: account.balance,
            });
        }
        account.balance -= amount;
        account.reserved += amount;
        account.updated_at = Utc::now();
        let snapshot = account.clone();
        Self::append_entry(&mut state, did, LedgerEntryType::Reserve, amount, intent_id, None);
        Ok(snapshot)
    }

    async fn release(
        &self,
        did: &Did,
        reserved_amount: i64,
        spend_amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut state = Self::lock(&self.ledger, "ledger")?;
        let account = Self::account_mut(&mut state, did)?;
        if account.reserved < reserved_amount {
            return Err(StorageError::InsufficientReserved {
                requested: reserved_amount,
                reserved: account.reserved,
            });
        }
        if spend_amount > reserved_amount {
            return Err(StorageError::InvalidInput(format!(
                "spend {spend_amount} exceeds released reservation {reserved_amount}"
            )));
        }

        let refund = reserved_amount - spend_amount;
        account.reserved -= reserved_amount;
        account.balance += refund;
        account.lifetime_spent += spend_amount;
        account.updated_at = Utc::now();
        let snapshot = account.clone();

        if refund > 0 || spend_amount == 0 {
            Self::append_entry(&mut state, did, LedgerEntryType::Release, refund, intent_id, None);
        }
        if spend_amount > 0 {
            Self::append_entry(&mut state, did, LedgerEntryType::Spend, spend_amount, intent_id, None);
        }
        Ok(snapshot)
    }

    async fn earn(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
        proof_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut state = Self::lock(&self.ledger, "ledger")?;
        let account = Self::account_mut(&mut state, did)?;
        account.balance += amount;
        account.lifetime_earned += amount;
        account.updated_at = Utc::now();
        let snapshot = account.clone();
        Self::append_entry(&mut state, did, LedgerEntryType::Earn, amount, intent_id, proof_id);
        Ok(snapshot)
    }

    async fn charge(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut state = Self::lock(&self.ledger, "ledger")?;
        let account = Self::account_mut(&mut state, did)?;
        if account.balance < amount {
            return Err(StorageError::InsufficientBalance {
                requested: amount,
                available: account.balance,
            });
        }
        account.balance -= amount;
        account.lifetime_spent += amount;
        account.updated_at = Utc::now();
        let snapshot = account.clone();
        Self::append_entry(&mut state, did, LedgerEntryType::Spend, amount, intent_id, None);
        Ok(snapshot)
    }

    async fn list_entries(
        &self,
        did: &Did,
        window: QueryWindow,
    ) -> StorageResult<Vec<LedgerEntryRecord>> {
        let state = Self::lock(&self.ledger, "ledger")?;
        let mut entries: Vec<LedgerEntryRecord> = state
            .entries
            .iter()
            .filter(|e| &e.owner_did == did)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.at.cmp(&a.at));
        Ok(apply_window(entries, window))
    }
}

#[async_trait]
impl PaymentStore for InMemoryBrokerStorage {
    async fn insert_payment_request(&self, request: PaymentRequestRecord) -> StorageResult<()> {
        let mut payments = Self::lock(&self.payments, "payments")?;
        if payments.contains_key(&request.id) {
            return Err(StorageError::Conflict(format!(
                "payment request {} already exists",
                request.id
            )));
        }
        payments.insert(request.id.clone(), request);
        Ok(())
    }

    async fn get_payment_request(
        &self,
        id: &str,
    ) -> StorageResult<Option<PaymentRequestRecord>> {
        Ok(Self::lock(&self.payments, "payments")?.get(id).cloned())
    }

    async fn transition_payment(
        &self,
        id: &str,
        expected: PaymentState,
        to: PaymentState,
    ) -> StorageResult<PaymentRequestRecord> {
        let mut payments = Self::lock(&self.payments, "payments")?;
        let request = payments
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("payment request {id}")))?;
        if request.state != expected {
            return Err(StorageError::InvariantViolation(format!(
                "payment {id}: expected state {:?}, found {:?}",
                expected, request.state
            )));
        }
        request.state = to;
        Ok(request.clone())
    }

    async fn list_expired_payments(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<PaymentRequestRecord>> {
        let payments = Self::lock(&self.payments, "payments")?;
        Ok(payments
            .values()
            .filter(|p| p.state == PaymentState::Pending && p.expires_at <= now)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProofStore for InMemoryBrokerStorage {
    async fn insert_proof(&self, proof: UsefulnessProof) -> StorageResult<()> {
        let mut proofs = Self::lock(&self.proofs, "proofs")?;
        if proofs.iter().any(|p| p.id == proof.id) {
            return Err(StorageError::Conflict(format!(
                "proof {} already exists",
                proof.id
            )));
        }
        proofs.push(proof);
        Ok(())
    }

    async fn list_proofs_since(
        &self,
        did: &Did,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<UsefulnessProof>> {
        let proofs = Self::lock(&self.proofs, "proofs")?;
        Ok(proofs
            .iter()
            .filter(|p| &p.agent_did == did && p.created_at >= since)
            .cloned()
            .collect())
    }

    async fn list_agents_with_proofs(&self) -> StorageResult<Vec<Did>> {
        let proofs = Self::lock(&self.proofs, "proofs")?;
        let mut dids: Vec<Did> = proofs.iter().map(|p| p.agent_did.clone()).collect();
        dids.sort();
        dids.dedup();
        Ok(dids)
    }
}

#[async_trait]
impl ReceiptStore for InMemoryBrokerStorage {
    async fn insert_receipt(&self, receipt: TaskReceipt) -> StorageResult<()> {
        let mut state = Self::lock(&self.receipts, "receipts")?;
        if state.receipts.contains_key(&receipt.id) {
            return Err(StorageError::Conflict(format!(
                "receipt {} already exists",
                receipt.id
            )));
        }
        state.receipts.insert(receipt.id.clone(), receipt);
        Ok(())
    }

    async fn get_receipt(&self, id: &str) -> StorageResult<Option<TaskReceipt>> {
        Ok(Self::lock(&self.receipts, "receipts")?.receipts.get(id).cloned())
    }

    async fn add_attestation(
        &self,
        receipt_id: &str,
        attestation: Attestation,
    ) -> StorageResult<TaskReceipt> {
        let mut state = Self::lock(&self.receipts, "receipts")?;
        let receipt = state
            .receipts
            .get_mut(receipt_id)
            .ok_or_else(|| StorageError::NotFound(format!("receipt {receipt_id}")))?;

        if receipt.status == ReceiptStatus::Finalized {
            return Err(StorageError::Conflict(format!(
                "receipt {receipt_id} is already finalized"
            )));
        }
        if receipt
            .attestations
            .iter()
            .any(|a| a.by_did == attestation.by_did)
        {
            return Err(StorageError::Conflict(format!(
                "{} already attested receipt {receipt_id}",
                attestation.by_did
            )));
        }
        receipt.attestations.push(attestation);
        Ok(receipt.clone())
    }

    async fn finalize_receipt(&self, id: &str, at: DateTime<Utc>) -> StorageResult<TaskReceipt> {
        let mut state = Self::lock(&self.receipts, "receipts")?;
        let receipt = state
            .receipts
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("receipt {id}")))?;

        match receipt.status {
            ReceiptStatus::Finalized => Ok(receipt.clone()),
            ReceiptStatus::Disputed => Err(StorageError::InvariantViolation(format!(
                "receipt {id} is disputed"
            ))),
            ReceiptStatus::Pending => {
                receipt.status = ReceiptStatus::Finalized;
                receipt.finalized_at = Some(at);
                Ok(receipt.clone())
            }
        }
    }

    async fn list_pending_receipts(
        &self,
        window: QueryWindow,
    ) -> StorageResult<Vec<TaskReceipt>> {
        let state = Self::lock(&self.receipts, "receipts")?;
        let mut pending: Vec<TaskReceipt> = state
            .receipts
            .values()
            .filter(|r| r.status == ReceiptStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apply_window(pending, window))
    }

    async fn get_reputation(&self, did: &Did) -> StorageResult<Option<ReputationRecord>> {
        Ok(Self::lock(&self.receipts, "receipts")?
            .reputation
            .get(did)
            .cloned())
    }

    async fn upsert_reputation(&self, reputation: ReputationRecord) -> StorageResult<()> {
        Self::lock(&self.receipts, "receipts")?
            .reputation
            .insert(reputation.agent_did.clone(), reputation);
        Ok(())
    }
}

#[async_trait]
impl Probe for InMemoryBrokerStorage {
    async fn ping(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InboxCursor;
    use ainp_types::{MsgType, TaggedValue, TrustVector};

    fn did(s: &str) -> Did {
        Did::parse(s).unwrap()
    }

    fn agent(did_str: &str) -> AgentRecord {
        let now = Utc::now();
        AgentRecord {
            did: did(did_str),
            endpoint: None,
            public_key_hex: None,
            ttl_seconds: 3600,
            usefulness_cached: 0.0,
            usefulness_updated_at: None,
            registered_at: now,
            last_seen: now,
        }
    }

    fn message(owner: &Did, envelope_id: &str, conversation: &str) -> MessageRecord {
        MessageRecord {
            id: Uuid::new_v4(),
            owner_did: owner.clone(),
            envelope_id: envelope_id.to_string(),
            from_did: did("did:key:sender"),
            conversation_id: conversation.to_string(),
            msg_type: MsgType::Intent,
            payload: TaggedValue::Null,
            read: false,
            labels: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reregistration_keeps_identity_and_refreshes_address() {
        let storage = InMemoryBrokerStorage::new();
        let mut record = agent("did:key:aa");
        storage.upsert_agent(record.clone()).await.unwrap();
        let registered_at = storage
            .get_agent(&record.did)
            .await
            .unwrap()
            .unwrap()
            .registered_at;

        record.endpoint = Some("https://example.org".to_string());
        storage.upsert_agent(record.clone()).await.unwrap();

        let stored = storage.get_agent(&record.did).await.unwrap().unwrap();
        assert_eq!(stored.registered_at, registered_at);
        assert_eq!(stored.endpoint.as_deref(), Some("https://example.org"));
    }

    #[tokio::test]
    async fn store_message_is_idempotent_per_envelope() {
        let storage = InMemoryBrokerStorage::new();
        let owner = did("did:key:owner");

        let first = storage.store_message(message(&owner, "e-1", "c-1")).await.unwrap();
        let replay = storage.store_message(message(&owner, "e-1", "c-1")).await.unwrap();
        assert!(first.inserted);
        assert!(!replay.inserted);

        let thread = storage.get_thread(&owner, "c-1").await.unwrap().unwrap();
        assert_eq!(thread.message_count, 1);
        assert_eq!(thread.unread_count, 1);
    }

    #[tokio::test]
    async fn unread_count_tracks_read_flag_idempotently() {
        let storage = InMemoryBrokerStorage::new();
        let owner = did("did:key:owner");
        let record = message(&owner, "e-1", "c-1");
        let id = record.id;
        storage.store_message(record).await.unwrap();

        storage.set_read(&owner, &id, true).await.unwrap();
        storage.set_read(&owner, &id, true).await.unwrap();
        let thread = storage.get_thread(&owner, "c-1").await.unwrap().unwrap();
        assert_eq!(thread.unread_count, 0);

        storage.set_read(&owner, &id, false).await.unwrap();
        let thread = storage.get_thread(&owner, "c-1").await.unwrap().unwrap();
        assert_eq!(thread.unread_count, 1);
    }

    #[tokio::test]
    async fn inbox_keyset_pagination_descends_without_overlap() {
        let storage = InMemoryBrokerStorage::new();
        let owner = did("did:key:owner");
        for i in 0..5 {
            storage
                .store_message(message(&owner, &format!("e-{i}"), "c-1"))
                .await
                .unwrap();
        }

        let first_page = storage
            .list_inbox(
                &owner,
                InboxQuery {
                    limit: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(first_page.len(), 2);

        let cursor = InboxCursor {
            created_at: first_page[1].created_at,
            id: first_page[1].id,
        };
        let second_page = storage
            .list_inbox(
                &owner,
                InboxQuery {
                    limit: 10,
                    cursor: Some(cursor),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second_page.len(), 3);

        let seen: Vec<Uuid> = first_page.iter().chain(&second_page).map(|m| m.id).collect();
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(seen.len(), deduped.len());
    }

    #[tokio::test]
    async fn reserve_and_release_round_trip_restores_balance() {
        let storage = InMemoryBrokerStorage::new();
        let owner = did("did:key:acct");
        storage.create_account(&owner, 1_000).await.unwrap();

        storage.reserve(&owner, 400, Some("i-1")).await.unwrap();
        let account = storage.release(&owner, 400, 400, Some("i-1")).await.unwrap();
        assert_eq!(account.balance, 600);
        assert_eq!(account.reserved, 0);
        assert_eq!(account.lifetime_spent, 400);

        // reserve + spend = two journal entries beyond the opening deposit.
        let entries = storage
            .list_entries(&owner, QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn reserve_fails_without_balance() {
        let storage = InMemoryBrokerStorage::new();
        let owner = did("did:key:poor");
        storage.create_account(&owner, 10).await.unwrap();
        assert!(matches!(
            storage.reserve(&owner, 11, None).await,
            Err(StorageError::InsufficientBalance { .. })
        ));
    }

    #[tokio::test]
    async fn negotiation_cas_detects_lost_race() {
        let storage = InMemoryBrokerStorage::new();
        let record = NegotiationRecord {
            id: "n-1".to_string(),
            intent_id: "i-1".to_string(),
            initiator_did: did("did:key:aa"),
            responder_did: did("did:key:bb"),
            state: NegotiationState::Initiated,
            max_rounds: 10,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(10),
            rounds: vec![],
            current_proposal: None,
            final_proposal: None,
            convergence_score: 0.0,
            incentive_split: Default::default(),
            reserved_credits: None,
        };
        storage.insert_negotiation(record.clone()).await.unwrap();

        let mut updated = record.clone();
        updated.state = NegotiationState::Proposed;
        storage
            .update_negotiation(updated.clone(), NegotiationState::Initiated)
            .await
            .unwrap();

        // Second writer raced on the stale expected state.
        assert!(matches!(
            storage
                .update_negotiation(updated, NegotiationState::Initiated)
                .await,
            Err(StorageError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_similarity() {
        let storage = InMemoryBrokerStorage::new();
        let a = did("did:key:aa");
        let b = did("did:key:bb");
        storage.upsert_agent(agent("did:key:aa")).await.unwrap();
        storage.upsert_agent(agent("did:key:bb")).await.unwrap();
        storage
            .upsert_trust(TrustRecord {
                agent_did: a.clone(),
                vector: TrustVector::default(),
                decay_rate: 0.977,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let cap = |agent_did: &Did, embedding: Vec<f32>| CapabilityRecord {
            id: Uuid::new_v4(),
            agent_did: agent_did.clone(),
            description: "capability".to_string(),
            embedding,
            tags: vec![],
            version: "1.0.0".to_string(),
            credential_ref: None,
            updated_at: Utc::now(),
        };
        storage
            .replace_capabilities(&a, vec![cap(&a, vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        storage
            .replace_capabilities(&b, vec![cap(&b, vec![0.8, 0.6, 0.0])])
            .await
            .unwrap();

        let hits = storage
            .search_capabilities(&[1.0, 0.0, 0.0], 10, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].capability.agent_did, a);
        assert!(hits[0].similarity > hits[1].similarity);
        assert!(hits[0].trust.is_some());
        assert!(hits[1].trust.is_none());
    }

    #[tokio::test]
    async fn attestations_are_unique_per_member_and_finalize_is_idempotent() {
        let storage = InMemoryBrokerStorage::new();
        let receipt = TaskReceipt {
            id: "r-1".to_string(),
            negotiation_id: "n-1".to_string(),
            agent_did: did("did:key:aa"),
            client_did: did("did:key:bb"),
            k: 3,
            m: 5,
            committee: vec![did("did:key:cc")],
            attestations: vec![],
            status: ReceiptStatus::Pending,
            finalized_at: None,
            created_at: Utc::now(),
        };
        storage.insert_receipt(receipt).await.unwrap();

        let attestation = Attestation {
            by_did: did("did:key:cc"),
            attestation_type: ainp_types::AttestationType::Accepted,
            score: 0.9,
            confidence: 0.8,
            evidence_ref: None,
            signature: "sig".to_string(),
        };
        storage.add_attestation("r-1", attestation.clone()).await.unwrap();
        assert!(matches!(
            storage.add_attestation("r-1", attestation).await,
            Err(StorageError::Conflict(_))
        ));

        let now = Utc::now();
        let first = storage.finalize_receipt("r-1", now).await.unwrap();
        let second = storage.finalize_receipt("r-1", now).await.unwrap();
        assert_eq!(first.status, ReceiptStatus::Finalized);
        assert_eq!(first.finalized_at, second.finalized_at);
    }
}
