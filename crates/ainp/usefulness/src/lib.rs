//! Usefulness aggregation: proof ingest and rolling-window scoring.
//!
//! Scores are the mean `usefulness_score` over proofs from the last 30
//! days, overall and per work type. Discovery never reads live proofs; it
//! reads the per-agent cached score this crate's refresh job maintains, so
//! the hot path stays independent of aggregator load.

#![deny(unsafe_code)]

use ainp_storage::{AgentStore, ProofStore, StorageError};
use ainp_types::{Did, ProofError, UsefulnessProof, WorkType};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Rolling scoring window.
pub const SCORE_WINDOW_DAYS: i64 = 30;

/// Result type for aggregator operations.
pub type UsefulnessResult<T> = Result<T, UsefulnessError>;

/// A proof submission before it gets an id and timestamp.
#[derive(Clone, Debug)]
pub struct ProofSubmission {
    pub intent_id: String,
    pub agent_did: Did,
    pub work_type: WorkType,
    pub metrics: BTreeMap<String, f64>,
    pub attestations: Vec<String>,
    pub trace_id: String,
    pub usefulness_score: f64,
}

/// Rolling-window score for one agent.
#[derive(Clone, Debug, PartialEq)]
pub struct UsefulnessReport {
    pub agent_did: Did,
    pub overall: f64,
    pub by_work_type: BTreeMap<String, f64>,
    pub proof_count: usize,
}

/// Outcome of one cache refresh pass.
#[derive(Clone, Copy, Debug)]
pub struct RefreshOutcome {
    pub agents_refreshed: usize,
    pub elapsed_ms: u128,
}

/// The usefulness aggregator.
pub struct UsefulnessAggregator {
    proofs: Arc<dyn ProofStore>,
    agents: Arc<dyn AgentStore>,
}

impl UsefulnessAggregator {
    pub fn new(proofs: Arc<dyn ProofStore>, agents: Arc<dyn AgentStore>) -> Self {
        Self { proofs, agents }
    }

    /// Validate and persist one proof. Proofs are immutable once accepted.
    pub async fn submit_proof(
        &self,
        submission: ProofSubmission,
    ) -> UsefulnessResult<UsefulnessProof> {
        let proof = UsefulnessProof {
            id: uuid::Uuid::new_v4().to_string(),
            intent_id: submission.intent_id,
            agent_did: submission.agent_did,
            work_type: submission.work_type,
            metrics: submission.metrics,
            attestations: submission.attestations,
            trace_id: submission.trace_id,
            usefulness_score: submission.usefulness_score,
            created_at: Utc::now(),
        };
        proof.validate()?;
        self.proofs.insert_proof(proof.clone()).await?;
        tracing::debug!(
            agent = %proof.agent_did,
            work_type = proof.work_type.as_str(),
            score = proof.usefulness_score,
            "usefulness proof accepted"
        );
        Ok(proof)
    }

    /// Live rolling-window score: overall mean plus per-work-type means.
    /// Zero when the agent has no proofs in the window.
    pub async fn score(&self, agent_did: &Did) -> UsefulnessResult<UsefulnessReport> {
        let since = window_start(Utc::now());
        let proofs = self.proofs.list_proofs_since(agent_did, since).await?;

        let mut by_type: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        let mut total = 0.0;
        for proof in &proofs {
            total += proof.usefulness_score;
            let slot = by_type
                .entry(proof.work_type.as_str().to_string())
                .or_insert((0.0, 0));
            slot.0 += proof.usefulness_score;
            slot.1 += 1;
        }

        let overall = if proofs.is_empty() {
            0.0
        } else {
            total / proofs.len() as f64
        };
        Ok(UsefulnessReport {
            agent_did: agent_did.clone(),
            overall,
            by_work_type: by_type
                .into_iter()
                .map(|(work_type, (sum, count))| (work_type, sum / count as f64))
                .collect(),
            proof_count: proofs.len(),
        })
    }

    /// Recompute the cached score for every agent with at least one proof.
    /// Run from a cron-style job.
    pub async fn refresh_cache(&self) -> UsefulnessResult<RefreshOutcome> {
        let started = std::time::Instant::now();
        let agents = self.proofs.list_agents_with_proofs().await?;
        let now = Utc::now();

        let mut refreshed = 0;
        for agent_did in agents {
            let report = self.score(&agent_did).await?;
            match self
                .agents
                .set_cached_usefulness(&agent_did, report.overall, now)
                .await
            {
                Ok(()) => refreshed += 1,
                // Proofs may outlive a pruned agent row; skip, don't abort
                // the sweep.
                Err(StorageError::NotFound(_)) => {
                    tracing::warn!(agent = %agent_did, "skipping cache refresh for unknown agent");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let outcome = RefreshOutcome {
            agents_refreshed: refreshed,
            elapsed_ms: started.elapsed().as_millis(),
        };
        tracing::info!(
            agents = outcome.agents_refreshed,
            elapsed_ms = outcome.elapsed_ms as u64,
            "usefulness cache refreshed"
        );
        Ok(outcome)
    }
}

fn window_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now - ChronoDuration::days(SCORE_WINDOW_DAYS)
}

/// Aggregator errors.
#[derive(Debug, Error)]
pub enum UsefulnessError {
    #[error(transparent)]
    InvalidProof(#[from] ProofError),

    #[error("duplicate proof: {0}")]
    Duplicate(String),

    #[error("usefulness backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for UsefulnessError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Conflict(what) => Self::Duplicate(what),
            other => Self::Backend(other.to_string()),
        }
    }
}
