//! Negotiation state machine.
//!
//! `initiated → proposed ↔ counter_proposed → {accepted, rejected, expired}`
//! with sink enforcement, per-round convergence scoring, and credit escrow:
//! accepting reserves `price·1000` atomic credits from the initiator, and
//! settlement releases the escrow through the incentive distributor and
//! opens a task receipt. Concurrent transitions serialize through a
//! compare-and-swap on the stored session state; the first writer wins.

#![deny(unsafe_code)]

use ainp_ledger::{CreditLedger, Distribution, DistributionRequest, IncentiveDistributor, LedgerError};
use ainp_reputation::ReceiptService;
use ainp_storage::{
    NegotiationFilter, NegotiationRecord, NegotiationStore, QueryWindow, StorageError,
};
use ainp_types::{
    Did, IncentiveSplit, NegotiationState, Proposal, Round, TaggedValue, TaskReceipt,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Result type for negotiation operations.
pub type NegotiationResult<T> = Result<T, NegotiationError>;

/// Upper bound on rounds per session.
pub const MAX_ROUNDS_CAP: u32 = 20;

/// Negotiation defaults.
#[derive(Clone, Debug)]
pub struct NegotiationConfig {
    pub default_max_rounds: u32,
    pub default_ttl_minutes: i64,
    /// Broker's own account for its settlement share, when configured.
    pub broker_did: Option<Did>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            default_max_rounds: 10,
            default_ttl_minutes: 60,
            broker_did: None,
        }
    }
}

/// Inputs to `initiate`.
#[derive(Clone, Debug)]
pub struct InitiateRequest {
    pub intent_id: String,
    pub initiator: Did,
    pub responder: Did,
    pub proposal: Proposal,
    pub max_rounds: Option<u32>,
    pub ttl_minutes: Option<i64>,
    pub incentive_split: Option<IncentiveSplit>,
}

/// Settlement outcome.
#[derive(Clone, Debug)]
pub struct SettleOutcome {
    pub negotiation: NegotiationRecord,
    pub distribution: Distribution,
    pub receipt: TaskReceipt,
}

/// The negotiation service.
pub struct NegotiationService {
    storage: Arc<dyn NegotiationStore>,
    ledger: Arc<CreditLedger>,
    distributor: Arc<IncentiveDistributor>,
    receipts: Arc<ReceiptService>,
    config: NegotiationConfig,
}

impl NegotiationService {
    pub fn new(
        storage: Arc<dyn NegotiationStore>,
        ledger: Arc<CreditLedger>,
        distributor: Arc<IncentiveDistributor>,
        receipts: Arc<ReceiptService>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            storage,
            ledger,
            distributor,
            receipts,
            config,
        }
    }

    /// Open a session. The initial proposal counts as round 1.
    pub async fn initiate(&self, request: InitiateRequest) -> NegotiationResult<NegotiationRecord> {
        if request.initiator == request.responder {
            return Err(NegotiationError::InvalidParticipants);
        }
        let max_rounds = request.max_rounds.unwrap_or(self.config.default_max_rounds);
        if !(1..=MAX_ROUNDS_CAP).contains(&max_rounds) {
            return Err(NegotiationError::InvalidMaxRounds(max_rounds));
        }
        let split = request.incentive_split.unwrap_or_default();
        split
            .validate()
            .map_err(|e| NegotiationError::InvalidSplit(e.to_string()))?;

        let now = Utc::now();
        let ttl_minutes = request.ttl_minutes.unwrap_or(self.config.default_ttl_minutes);
        let record = NegotiationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            intent_id: request.intent_id,
            initiator_did: request.initiator.clone(),
            responder_did: request.responder,
            state: NegotiationState::Initiated,
            max_rounds,
            created_at: now,
            expires_at: now + ChronoDuration::minutes(ttl_minutes.max(0)),
            rounds: vec![Round {
                round_number: 1,
                proposer_did: request.initiator,
                proposal: request.proposal.clone(),
                timestamp: now,
                convergence_delta: 0.0,
            }],
            current_proposal: Some(request.proposal),
            final_proposal: None,
            convergence_score: 0.0,
            incentive_split: split,
            reserved_credits: None,
        };
        self.storage.insert_negotiation(record.clone()).await?;
        tracing::debug!(negotiation = %record.id, "negotiation initiated");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> NegotiationResult<NegotiationRecord> {
        self.storage
            .get_negotiation(id)
            .await?
            .ok_or_else(|| NegotiationError::NotFound(id.to_string()))
    }

    pub async fn list(
        &self,
        filter: NegotiationFilter,
        window: QueryWindow,
    ) -> NegotiationResult<Vec<NegotiationRecord>> {
        Ok(self.storage.list_negotiations(filter, window).await?)
    }

    /// Append a counter-proposal round.
    pub async fn propose(
        &self,
        id: &str,
        proposer: &Did,
        proposal: Proposal,
    ) -> NegotiationResult<NegotiationRecord> {
        let mut record = self.get(id).await?;
        let now = Utc::now();
        Self::require_open(&record, now)?;
        Self::require_participant(&record, proposer)?;

        if record.rounds.len() as u32 >= record.max_rounds {
            return Err(NegotiationError::MaxRoundsExceeded {
                max_rounds: record.max_rounds,
            });
        }

        let previous_state = record.state;
        let convergence_delta = record
            .current_proposal
            .as_ref()
            .map(|current| current.convergence_with(&proposal))
            .unwrap_or(0.0);

        record.state = match record.state {
            NegotiationState::Initiated => NegotiationState::Proposed,
            NegotiationState::Proposed => NegotiationState::CounterProposed,
            NegotiationState::CounterProposed => NegotiationState::Proposed,
            sink => {
                return Err(NegotiationError::InvalidStateTransition(format!(
                    "cannot propose from {sink:?}"
                )))
            }
        };
        record.rounds.push(Round {
            round_number: record.rounds.len() as u32 + 1,
            proposer_did: proposer.clone(),
            proposal: proposal.clone(),
            timestamp: now,
            convergence_delta,
        });
        record.current_proposal = Some(proposal);
        record.convergence_score = convergence_delta;

        self.storage
            .update_negotiation(record.clone(), previous_state)
            .await?;
        Ok(record)
    }

    /// Accept the counter-party's current proposal. Atomically reserves
    /// `price·1000` from the initiator; a failed reservation aborts the
    /// transition.
    pub async fn accept(&self, id: &str, acceptor: &Did) -> NegotiationResult<NegotiationRecord> {
        let mut record = self.get(id).await?;
        let now = Utc::now();
        Self::require_open(&record, now)?;
        Self::require_participant(&record, acceptor)?;

        if !matches!(
            record.state,
            NegotiationState::Proposed | NegotiationState::CounterProposed
        ) {
            return Err(NegotiationError::InvalidStateTransition(format!(
                "cannot accept from {:?}",
                record.state
            )));
        }

        let last_round = record
            .rounds
            .last()
            .ok_or_else(|| NegotiationError::NothingToAccept)?;
        if &last_round.proposer_did == acceptor {
            return Err(NegotiationError::NothingToAccept);
        }
        let mut final_proposal = record
            .current_proposal
            .clone()
            .ok_or(NegotiationError::NothingToAccept)?;

        let reserve_amount = final_proposal.price_atomic().unwrap_or(0);
        if reserve_amount > 0 {
            self.ledger
                .reserve(
                    &record.initiator_did,
                    reserve_amount,
                    Some(record.intent_id.as_str()),
                )
                .await
                .map_err(NegotiationError::reservation)?;
            final_proposal.custom_terms.insert(
                "reserved_credits".to_string(),
                TaggedValue::Number(reserve_amount as f64),
            );
        }

        let previous_state = record.state;
        record.state = NegotiationState::Accepted;
        record.final_proposal = Some(final_proposal);
        record.reserved_credits = (reserve_amount > 0).then_some(reserve_amount);

        if let Err(e) = self
            .storage
            .update_negotiation(record.clone(), previous_state)
            .await
        {
            // Lost the race after reserving: undo the escrow.
            if reserve_amount > 0 {
                if let Err(release_err) = self
                    .ledger
                    .release(
                        &record.initiator_did,
                        reserve_amount,
                        0,
                        Some(record.intent_id.as_str()),
                    )
                    .await
                {
                    tracing::error!(
                        negotiation = %record.id,
                        error = %release_err,
                        "failed to roll back reservation after lost accept race"
                    );
                }
            }
            return Err(e.into());
        }

        tracing::info!(
            negotiation = %record.id,
            reserved = reserve_amount,
            "negotiation accepted"
        );
        Ok(record)
    }

    /// Reject from any non-sink state; writes a terminal round.
    pub async fn reject(
        &self,
        id: &str,
        rejector: &Did,
        reason: Option<String>,
    ) -> NegotiationResult<NegotiationRecord> {
        let mut record = self.get(id).await?;
        Self::require_participant(&record, rejector)?;
        if record.state.is_sink() {
            return Err(NegotiationError::InvalidStateTransition(format!(
                "cannot reject from {:?}",
                record.state
            )));
        }

        let mut terminal = Proposal::default();
        terminal
            .custom_terms
            .insert("rejected".to_string(), TaggedValue::Bool(true));
        if let Some(reason) = &reason {
            terminal
                .custom_terms
                .insert("reason".to_string(), TaggedValue::String(reason.clone()));
        }

        let previous_state = record.state;
        record.rounds.push(Round {
            round_number: record.rounds.len() as u32 + 1,
            proposer_did: rejector.clone(),
            proposal: terminal,
            timestamp: Utc::now(),
            convergence_delta: 0.0,
        });
        record.state = NegotiationState::Rejected;

        self.storage
            .update_negotiation(record.clone(), previous_state)
            .await?;
        tracing::debug!(negotiation = %record.id, ?reason, "negotiation rejected");
        Ok(record)
    }

    /// Settle an accepted session: spend the escrow, distribute shares, and
    /// open the task receipt.
    pub async fn settle(
        &self,
        id: &str,
        validator_did: Option<Did>,
        usefulness_proof_id: Option<String>,
    ) -> NegotiationResult<SettleOutcome> {
        let mut record = self.get(id).await?;
        if record.state != NegotiationState::Accepted {
            return Err(NegotiationError::InvalidStateTransition(format!(
                "cannot settle from {:?}",
                record.state
            )));
        }
        let already_settled = record
            .final_proposal
            .as_ref()
            .and_then(|p| p.custom_terms.get("settled"))
            .is_some();
        if already_settled {
            return Err(NegotiationError::InvalidStateTransition(
                "negotiation is already settled".to_string(),
            ));
        }

        let reserved = record.reserved_credits.unwrap_or(0);
        if reserved > 0 {
            self.ledger
                .release(
                    &record.initiator_did,
                    reserved,
                    reserved,
                    Some(record.intent_id.as_str()),
                )
                .await
                .map_err(NegotiationError::reservation)?;
        }

        let distribution_request = DistributionRequest {
            intent_id: record.intent_id.clone(),
            total_amount: reserved,
            agent_did: record.responder_did.clone(),
            broker_did: self.config.broker_did.clone(),
            validator_did: validator_did.clone(),
            incentive_split: record.incentive_split,
            usefulness_proof_id: usefulness_proof_id.clone(),
        };
        let distribution = self
            .distributor
            .distribute(&distribution_request)
            .await
            .map_err(NegotiationError::reservation)?;

        let receipt = self
            .receipts
            .create_receipt(
                &record.id,
                &record.responder_did,
                &record.initiator_did,
                None,
                None,
            )
            .await
            .map_err(|e| NegotiationError::Backend(e.to_string()))?;

        if let Some(final_proposal) = record.final_proposal.as_mut() {
            final_proposal
                .custom_terms
                .insert("settled".to_string(), TaggedValue::Bool(true));
            if let Some(validator) = &validator_did {
                final_proposal.custom_terms.insert(
                    "validator_did".to_string(),
                    TaggedValue::String(validator.to_string()),
                );
            }
            if let Some(proof_id) = &usefulness_proof_id {
                final_proposal.custom_terms.insert(
                    "usefulness_proof_id".to_string(),
                    TaggedValue::String(proof_id.clone()),
                );
            }
        }
        record.reserved_credits = None;
        self.storage
            .update_negotiation(record.clone(), NegotiationState::Accepted)
            .await?;

        tracing::info!(
            negotiation = %record.id,
            total = reserved,
            receipt = %receipt.id,
            "negotiation settled"
        );
        Ok(SettleOutcome {
            negotiation: record,
            distribution,
            receipt,
        })
    }

    /// Batch job: sink every non-sink session past its deadline and refund
    /// any reservation to the initiator.
    pub async fn expire_stale(&self) -> NegotiationResult<usize> {
        let now = Utc::now();
        let stale = self.storage.list_expired(now).await?;
        let mut expired = 0;

        for mut record in stale {
            let previous_state = record.state;
            if let Some(reserved) = record.reserved_credits.take() {
                if reserved > 0 {
                    if let Err(e) = self
                        .ledger
                        .release(
                            &record.initiator_did,
                            reserved,
                            0,
                            Some(record.intent_id.as_str()),
                        )
                        .await
                    {
                        tracing::error!(
                            negotiation = %record.id,
                            error = %e,
                            "failed to refund reservation on expiry"
                        );
                        continue;
                    }
                }
            }
            record.state = NegotiationState::Expired;
            match self.storage.update_negotiation(record, previous_state).await {
                Ok(()) => expired += 1,
                // Lost a race with a live transition; the sweep catches it
                // next tick if it is still stale.
                Err(StorageError::InvariantViolation(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if expired > 0 {
            tracing::info!(count = expired, "expired stale negotiations");
        }
        Ok(expired)
    }

    fn require_open(record: &NegotiationRecord, now: DateTime<Utc>) -> NegotiationResult<()> {
        if record.state.is_sink() {
            return Err(NegotiationError::InvalidStateTransition(format!(
                "negotiation is {:?}",
                record.state
            )));
        }
        if record.expires_at <= now {
            return Err(NegotiationError::ExpiredNegotiation);
        }
        Ok(())
    }

    fn require_participant(record: &NegotiationRecord, who: &Did) -> NegotiationResult<()> {
        if who != &record.initiator_did && who != &record.responder_did {
            return Err(NegotiationError::NotParticipant(who.clone()));
        }
        Ok(())
    }
}

/// Negotiation errors.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("initiator and responder must differ")]
    InvalidParticipants,

    #[error("max_rounds must be between 1 and 20, got {0}")]
    InvalidMaxRounds(u32),

    #[error("invalid incentive split: {0}")]
    InvalidSplit(String),

    #[error("negotiation not found: {0}")]
    NotFound(String),

    #[error("{0} is not a participant in this negotiation")]
    NotParticipant(Did),

    #[error("negotiation has expired")]
    ExpiredNegotiation,

    #[error("maximum of {max_rounds} rounds exceeded")]
    MaxRoundsExceeded { max_rounds: u32 },

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("no counter-party proposal to accept")]
    NothingToAccept,

    #[error("credit reservation failed: {0}")]
    ReservationFailed(String),

    #[error("insufficient balance to reserve {requested} atomic credits")]
    InsufficientCredits { requested: i64 },

    #[error("negotiation backend error: {0}")]
    Backend(String),
}

impl NegotiationError {
    fn reservation(error: LedgerError) -> Self {
        match error {
            LedgerError::InsufficientBalance { requested, .. } => {
                Self::InsufficientCredits { requested }
            }
            other => Self::ReservationFailed(other.to_string()),
        }
    }
}

impl From<StorageError> for NegotiationError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(what) => Self::NotFound(what),
            StorageError::InvariantViolation(what) => Self::InvalidStateTransition(what),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_reputation::ReceiptConfig;
    use ainp_storage::memory::InMemoryBrokerStorage;
    use proptest::prelude::*;

    fn did(s: &str) -> Did {
        Did::parse(s).unwrap()
    }

    fn priced(price: f64) -> Proposal {
        Proposal {
            price: Some(price),
            ..Default::default()
        }
    }

    struct Fixture {
        service: NegotiationService,
        ledger: Arc<CreditLedger>,
        initiator: Did,
        responder: Did,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryBrokerStorage::new());
        let ledger = Arc::new(CreditLedger::new(storage.clone()));
        let pool = did("did:key:pool");
        ledger.create_account(&pool, 0).await.unwrap();
        let distributor = Arc::new(IncentiveDistributor::new(ledger.clone(), pool));
        let receipts = Arc::new(ReceiptService::new(
            storage.clone(),
            storage.clone(),
            ReceiptConfig::default(),
        ));
        let service = NegotiationService::new(
            storage,
            ledger.clone(),
            distributor,
            receipts,
            NegotiationConfig::default(),
        );

        let initiator = did("did:key:initiator");
        let responder = did("did:key:responder");
        ledger.create_account(&initiator, 1_000_000).await.unwrap();
        ledger.create_account(&responder, 0).await.unwrap();
        Fixture {
            service,
            ledger,
            initiator,
            responder,
        }
    }

    fn request(f: &Fixture, price: f64) -> InitiateRequest {
        InitiateRequest {
            intent_id: "intent-1".to_string(),
            initiator: f.initiator.clone(),
            responder: f.responder.clone(),
            proposal: priced(price),
            max_rounds: None,
            ttl_minutes: None,
            incentive_split: None,
        }
    }

    #[tokio::test]
    async fn initiate_creates_round_one_by_initiator() {
        let f = fixture().await;
        let record = f.service.initiate(request(&f, 100.0)).await.unwrap();
        assert_eq!(record.state, NegotiationState::Initiated);
        assert_eq!(record.rounds.len(), 1);
        assert_eq!(record.rounds[0].proposer_did, f.initiator);
        assert!(record.reserved_credits.is_none());
    }

    #[tokio::test]
    async fn initiate_rejects_self_negotiation_and_bad_rounds() {
        let f = fixture().await;
        let mut bad = request(&f, 100.0);
        bad.responder = f.initiator.clone();
        assert!(matches!(
            f.service.initiate(bad).await,
            Err(NegotiationError::InvalidParticipants)
        ));

        let mut bad = request(&f, 100.0);
        bad.max_rounds = Some(0);
        assert!(matches!(
            f.service.initiate(bad).await,
            Err(NegotiationError::InvalidMaxRounds(0))
        ));
        let mut bad = request(&f, 100.0);
        bad.max_rounds = Some(21);
        assert!(matches!(
            f.service.initiate(bad).await,
            Err(NegotiationError::InvalidMaxRounds(21))
        ));
    }

    #[tokio::test]
    async fn propose_alternates_states_and_scores_convergence() {
        let f = fixture().await;
        let record = f.service.initiate(request(&f, 100.0)).await.unwrap();

        let after = f
            .service
            .propose(&record.id, &f.responder, priced(80.0))
            .await
            .unwrap();
        assert_eq!(after.state, NegotiationState::Proposed);
        // 1 - 20/100 = 0.8
        assert!((after.convergence_score - 0.8).abs() < 1e-9);

        let after = f
            .service
            .propose(&record.id, &f.initiator, priced(90.0))
            .await
            .unwrap();
        assert_eq!(after.state, NegotiationState::CounterProposed);
        assert_eq!(after.rounds.len(), 3);
    }

    #[tokio::test]
    async fn max_rounds_counts_the_initial_proposal() {
        let f = fixture().await;
        let mut req = request(&f, 100.0);
        req.max_rounds = Some(2);
        let record = f.service.initiate(req).await.unwrap();

        f.service
            .propose(&record.id, &f.responder, priced(80.0))
            .await
            .unwrap();
        assert!(matches!(
            f.service
                .propose(&record.id, &f.initiator, priced(85.0))
                .await,
            Err(NegotiationError::MaxRoundsExceeded { max_rounds: 2 })
        ));
    }

    #[tokio::test]
    async fn max_rounds_one_permits_initiate_only() {
        let f = fixture().await;
        let mut req = request(&f, 100.0);
        req.max_rounds = Some(1);
        let record = f.service.initiate(req).await.unwrap();

        assert!(matches!(
            f.service
                .propose(&record.id, &f.responder, priced(80.0))
                .await,
            Err(NegotiationError::MaxRoundsExceeded { max_rounds: 1 })
        ));
    }

    #[tokio::test]
    async fn accept_reserves_price_times_thousand_from_initiator() {
        let f = fixture().await;
        let record = f.service.initiate(request(&f, 100.0)).await.unwrap();
        f.service
            .propose(&record.id, &f.responder, priced(100.0))
            .await
            .unwrap();

        let accepted = f.service.accept(&record.id, &f.initiator).await.unwrap();
        assert_eq!(accepted.state, NegotiationState::Accepted);
        assert_eq!(accepted.reserved_credits, Some(100_000));

        let account = f.ledger.get_account(&f.initiator).await.unwrap();
        assert_eq!(account.balance, 900_000);
        assert_eq!(account.reserved, 100_000);
    }

    #[tokio::test]
    async fn cannot_accept_own_most_recent_proposal() {
        let f = fixture().await;
        let record = f.service.initiate(request(&f, 100.0)).await.unwrap();
        f.service
            .propose(&record.id, &f.responder, priced(80.0))
            .await
            .unwrap();

        // Responder proposed last; they have nothing to accept.
        assert!(matches!(
            f.service.accept(&record.id, &f.responder).await,
            Err(NegotiationError::NothingToAccept)
        ));
    }

    #[tokio::test]
    async fn failed_reservation_aborts_the_accept() {
        let f = fixture().await;
        let record = f.service.initiate(request(&f, 5_000.0)).await.unwrap();
        f.service
            .propose(&record.id, &f.responder, priced(5_000.0))
            .await
            .unwrap();

        // 5,000,000 atomic > 1,000,000 balance.
        assert!(matches!(
            f.service.accept(&record.id, &f.initiator).await,
            Err(NegotiationError::InsufficientCredits { .. })
        ));
        let stored = f.service.get(&record.id).await.unwrap();
        assert_eq!(stored.state, NegotiationState::Proposed);
        assert!(stored.reserved_credits.is_none());
    }

    #[tokio::test]
    async fn reject_sinks_and_blocks_further_rounds() {
        let f = fixture().await;
        let record = f.service.initiate(request(&f, 100.0)).await.unwrap();
        let rejected = f
            .service
            .reject(&record.id, &f.responder, Some("too expensive".to_string()))
            .await
            .unwrap();
        assert_eq!(rejected.state, NegotiationState::Rejected);

        assert!(matches!(
            f.service
                .propose(&record.id, &f.initiator, priced(50.0))
                .await,
            Err(NegotiationError::InvalidStateTransition(_))
        ));
        assert!(matches!(
            f.service.accept(&record.id, &f.initiator).await,
            Err(NegotiationError::InvalidStateTransition(_))
        ));

        // No credits were ever reserved.
        let account = f.ledger.get_account(&f.initiator).await.unwrap();
        assert_eq!(account.reserved, 0);
        assert_eq!(account.balance, 1_000_000);
    }

    #[tokio::test]
    async fn settle_distributes_and_opens_receipt() {
        let f = fixture().await;
        let record = f.service.initiate(request(&f, 100.0)).await.unwrap();
        f.service
            .propose(&record.id, &f.responder, priced(100.0))
            .await
            .unwrap();
        f.service.accept(&record.id, &f.initiator).await.unwrap();

        let outcome = f.service.settle(&record.id, None, None).await.unwrap();
        assert_eq!(
            outcome.distribution.agent
                + outcome.distribution.broker
                + outcome.distribution.validator
                + outcome.distribution.pool,
            100_000
        );
        assert_eq!(outcome.receipt.negotiation_id, record.id);

        let initiator = f.ledger.get_account(&f.initiator).await.unwrap();
        assert_eq!(initiator.reserved, 0);
        assert_eq!(initiator.lifetime_spent, 100_000);

        let responder = f.ledger.get_account(&f.responder).await.unwrap();
        assert_eq!(responder.balance, 70_000);

        // Settling twice is refused.
        assert!(matches!(
            f.service.settle(&record.id, None, None).await,
            Err(NegotiationError::InvalidStateTransition(_))
        ));
    }

    #[tokio::test]
    async fn zero_ttl_sessions_expire_for_every_transition() {
        let f = fixture().await;
        let mut req = request(&f, 100.0);
        req.ttl_minutes = Some(0);
        let record = f.service.initiate(req).await.unwrap();

        assert!(matches!(
            f.service
                .propose(&record.id, &f.responder, priced(80.0))
                .await,
            Err(NegotiationError::ExpiredNegotiation)
        ));
        assert!(matches!(
            f.service.accept(&record.id, &f.initiator).await,
            Err(NegotiationError::ExpiredNegotiation)
        ));
        // Reject still works on an expired-but-unswept session.
        f.service.reject(&record.id, &f.initiator, None).await.unwrap();
    }

    #[tokio::test]
    async fn expire_stale_sweeps_and_sinks() {
        let f = fixture().await;
        let mut req = request(&f, 100.0);
        req.ttl_minutes = Some(0);
        let record = f.service.initiate(req).await.unwrap();

        let expired = f.service.expire_stale().await.unwrap();
        assert_eq!(expired, 1);
        let stored = f.service.get(&record.id).await.unwrap();
        assert_eq!(stored.state, NegotiationState::Expired);

        // Sinks never move again.
        assert!(f.service.expire_stale().await.unwrap() == 0);
    }

    #[derive(Debug, Clone)]
    enum Action {
        ProposeResponder,
        ProposeInitiator,
        Accept,
        Reject,
    }

    fn action_strategy() -> impl Strategy<Value = Vec<Action>> {
        proptest::collection::vec(
            prop_oneof![
                Just(Action::ProposeResponder),
                Just(Action::ProposeInitiator),
                Just(Action::Accept),
                Just(Action::Reject),
            ],
            1..12,
        )
    }

    proptest! {
        #[test]
        fn property_sink_states_are_terminal(actions in action_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async move {
                let f = fixture().await;
                let record = f.service.initiate(request(&f, 10.0)).await.expect("initiate");

                let mut sunk = false;
                for action in actions {
                    let result = match action {
                        Action::ProposeResponder => f
                            .service
                            .propose(&record.id, &f.responder, priced(9.0))
                            .await
                            .map(|_| ()),
                        Action::ProposeInitiator => f
                            .service
                            .propose(&record.id, &f.initiator, priced(9.5))
                            .await
                            .map(|_| ()),
                        Action::Accept => f.service.accept(&record.id, &f.initiator).await.map(|_| ()),
                        Action::Reject => f.service.reject(&record.id, &f.responder, None).await.map(|_| ()),
                    };

                    let state = f.service.get(&record.id).await.expect("get").state;
                    if sunk {
                        // Once sunk, every further transition must fail.
                        assert!(result.is_err());
                    }
                    sunk = state.is_sink();
                }
            });
        }
    }
}
