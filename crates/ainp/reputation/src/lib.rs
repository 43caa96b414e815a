//! Task receipts, committee attestations, and reputation.
//!
//! Settlement creates a receipt with a deterministic committee drawn from
//! the usefulness ranking. A receipt finalizes exactly once, when at least
//! `k` committee members attest the same outcome category and the client
//! has attested; finalization drives the responder's reputation dimensions
//! as an EMA over attestation scores.

#![deny(unsafe_code)]

use ainp_storage::{
    AgentStore, QueryWindow, ReceiptStore, ReputationRecord, StorageError,
};
use ainp_types::{
    Attestation, Did, ReceiptStatus, ReputationDimensions, TaskReceipt,
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

/// Result type for receipt operations.
pub type ReputationResult<T> = Result<T, ReputationError>;

/// Receipt defaults: k matching attestations out of an m-member committee.
#[derive(Clone, Copy, Debug)]
pub struct ReceiptConfig {
    pub default_k: u32,
    pub default_m: u32,
    pub ema_alpha: f64,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            default_k: 3,
            default_m: 5,
            ema_alpha: 0.2,
        }
    }
}

/// Outcome of one attestation submission.
#[derive(Clone, Debug)]
pub struct AttestationOutcome {
    pub receipt: TaskReceipt,
    pub finalized: bool,
}

/// The receipt and reputation service.
pub struct ReceiptService {
    receipts: Arc<dyn ReceiptStore>,
    agents: Arc<dyn AgentStore>,
    config: ReceiptConfig,
}

impl ReceiptService {
    pub fn new(
        receipts: Arc<dyn ReceiptStore>,
        agents: Arc<dyn AgentStore>,
        config: ReceiptConfig,
    ) -> Self {
        Self {
            receipts,
            agents,
            config,
        }
    }

    /// Create the settlement receipt for a negotiation. The committee is
    /// drawn deterministically from the top usefulness-ranked agents,
    /// excluding the two parties; (k, m) may be overridden per task.
    pub async fn create_receipt(
        &self,
        negotiation_id: &str,
        agent_did: &Did,
        client_did: &Did,
        k: Option<u32>,
        m: Option<u32>,
    ) -> ReputationResult<TaskReceipt> {
        let m = m.unwrap_or(self.config.default_m).max(1);
        let k = k.unwrap_or(self.config.default_k).clamp(1, m);

        let ranked = self
            .agents
            .list_agents_by_usefulness(m as usize + 2)
            .await?;
        let committee: Vec<Did> = ranked
            .into_iter()
            .map(|agent| agent.did)
            .filter(|did| did != agent_did && did != client_did)
            .take(m as usize)
            .collect();

        let receipt = TaskReceipt {
            id: uuid::Uuid::new_v4().to_string(),
            negotiation_id: negotiation_id.to_string(),
            agent_did: agent_did.clone(),
            client_did: client_did.clone(),
            k,
            m,
            committee,
            attestations: Vec::new(),
            status: ReceiptStatus::Pending,
            finalized_at: None,
            created_at: Utc::now(),
        };
        self.receipts.insert_receipt(receipt.clone()).await?;
        tracing::debug!(
            receipt = %receipt.id,
            negotiation = negotiation_id,
            committee = receipt.committee.len(),
            "task receipt created"
        );
        Ok(receipt)
    }

    pub async fn get_receipt(&self, id: &str) -> ReputationResult<TaskReceipt> {
        self.receipts
            .get_receipt(id)
            .await?
            .ok_or_else(|| ReputationError::NotFound(id.to_string()))
    }

    /// Accept one attestation from a committee member or the client, then
    /// attempt finalization.
    pub async fn submit_attestation(
        &self,
        receipt_id: &str,
        attestation: Attestation,
    ) -> ReputationResult<AttestationOutcome> {
        let receipt = self.get_receipt(receipt_id).await?;
        let is_committee = receipt.committee.contains(&attestation.by_did);
        let is_client = receipt.client_did == attestation.by_did;
        if !is_committee && !is_client {
            return Err(ReputationError::NotACommitteeMember(attestation.by_did));
        }

        let receipt = self.receipts.add_attestation(receipt_id, attestation).await?;
        let finalized = self.try_finalize(&receipt).await?;
        let receipt = self.get_receipt(receipt_id).await?;
        Ok(AttestationOutcome { receipt, finalized })
    }

    /// Finalize when the rule holds: ≥ k committee attestations of one
    /// outcome category, distinct by member, plus the client attestation.
    /// Idempotent; returns whether this call finalized the receipt.
    pub async fn try_finalize(&self, receipt: &TaskReceipt) -> ReputationResult<bool> {
        if receipt.status != ReceiptStatus::Pending {
            return Ok(false);
        }

        let client_attested = receipt
            .attestations
            .iter()
            .any(|a| a.by_did == receipt.client_did);
        if !client_attested {
            return Ok(false);
        }

        let committee_votes: Vec<&Attestation> = receipt
            .attestations
            .iter()
            .filter(|a| receipt.committee.contains(&a.by_did))
            .collect();
        let accepts: Vec<&&Attestation> = committee_votes
            .iter()
            .filter(|a| a.attestation_type.is_accept_class())
            .collect();
        let rejects = committee_votes.len() - accepts.len();

        let (winning, winning_votes): (bool, Vec<&Attestation>) =
            if accepts.len() >= receipt.k as usize {
                (true, accepts.into_iter().copied().collect())
            } else if rejects >= receipt.k as usize {
                (
                    false,
                    committee_votes
                        .iter()
                        .filter(|a| !a.attestation_type.is_accept_class())
                        .copied()
                        .collect(),
                )
            } else {
                return Ok(false);
            };

        self.receipts
            .finalize_receipt(&receipt.id, Utc::now())
            .await?;
        self.update_reputation(&receipt.agent_did, &winning_votes)
            .await?;
        tracing::info!(
            receipt = %receipt.id,
            accepted = winning,
            votes = winning_votes.len(),
            "task receipt finalized"
        );
        Ok(true)
    }

    /// Periodic sweep: finalize every pending receipt that already meets
    /// the rule. Returns how many finalized.
    pub async fn finalize_pending(&self) -> ReputationResult<usize> {
        let pending = self
            .receipts
            .list_pending_receipts(QueryWindow::default())
            .await?;
        let mut finalized = 0;
        for receipt in pending {
            if self.try_finalize(&receipt).await? {
                finalized += 1;
            }
        }
        Ok(finalized)
    }

    pub async fn get_reputation(&self, did: &Did) -> ReputationResult<Option<ReputationRecord>> {
        Ok(self.receipts.get_reputation(did).await?)
    }

    async fn update_reputation(
        &self,
        agent_did: &Did,
        votes: &[&Attestation],
    ) -> ReputationResult<()> {
        if votes.is_empty() {
            return Ok(());
        }
        let observation =
            votes.iter().map(|a| a.score).sum::<f64>() / votes.len() as f64;

        let mut record = self
            .receipts
            .get_reputation(agent_did)
            .await?
            .unwrap_or_else(|| ReputationRecord {
                agent_did: agent_did.clone(),
                dimensions: ReputationDimensions::default(),
                updated_at: Utc::now(),
            });
        record
            .dimensions
            .ema_update(observation, self.config.ema_alpha);
        record.updated_at = Utc::now();
        self.receipts.upsert_reputation(record).await?;
        Ok(())
    }
}

/// Receipt and reputation errors.
#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("receipt not found: {0}")]
    NotFound(String),

    #[error("{0} is neither a committee member nor the client")]
    NotACommitteeMember(Did),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("reputation backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for ReputationError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(what) => Self::NotFound(what),
            StorageError::Conflict(what) => Self::Conflict(what),
            other => Self::Backend(other.to_string()),
        }
    }
}
