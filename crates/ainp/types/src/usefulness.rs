use crate::Did;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Categories of useful work a proof may attest to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkType {
    Compute,
    Memory,
    Routing,
    Learning,
    Validation,
}

impl WorkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Memory => "memory",
            Self::Routing => "routing",
            Self::Learning => "learning",
            Self::Validation => "validation",
        }
    }
}

/// A submitted proof of useful work. Immutable once accepted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsefulnessProof {
    pub id: String,
    pub intent_id: String,
    pub agent_did: Did,
    pub work_type: WorkType,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub attestations: Vec<String>,
    pub trace_id: String,
    pub usefulness_score: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl UsefulnessProof {
    /// Validate score bounds. Scores live in [0, 100].
    pub fn validate(&self) -> Result<(), ProofError> {
        if !self.usefulness_score.is_finite()
            || !(0.0..=100.0).contains(&self.usefulness_score)
        {
            return Err(ProofError::ScoreOutOfRange(self.usefulness_score));
        }
        Ok(())
    }
}

/// Invalid usefulness proof.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("usefulness score out of range [0, 100]: {0}")]
    ScoreOutOfRange(f64),
}
