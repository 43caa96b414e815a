use crate::Did;
use serde::{Deserialize, Serialize};

/// Committee attestation outcome categories. `Accepted` and `AuditPass` are
/// accept-class; `Rejected` and `AuditFail` are fail-class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttestationType {
    Accepted,
    Rejected,
    AuditPass,
    AuditFail,
}

impl AttestationType {
    /// Accept-class vs fail-class grouping used by the finalization rule.
    pub fn is_accept_class(&self) -> bool {
        matches!(self, Self::Accepted | Self::AuditPass)
    }
}

/// A single committee or client attestation on a task receipt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attestation {
    pub by_did: Did,
    pub attestation_type: AttestationType,
    pub score: f64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    pub signature: String,
}

/// Task receipt lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Finalized,
    Disputed,
}

/// Settlement record for a negotiation's work outcome: finalized once at
/// least `k` of the `m` committee members attest the same outcome category
/// and the client has attested.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskReceipt {
    pub id: String,
    pub negotiation_id: String,
    pub agent_did: Did,
    pub client_did: Did,
    pub k: u32,
    pub m: u32,
    pub committee: Vec<Did>,
    pub attestations: Vec<Attestation>,
    pub status: ReceiptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Reputation dimensions updated by receipt finalization (EMA).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReputationDimensions {
    pub q: f64,
    pub t: f64,
    pub r: f64,
    pub s: f64,
    pub v: f64,
    pub i: f64,
    pub e: f64,
}

impl ReputationDimensions {
    /// Exponential moving average toward `observation` with factor `alpha`.
    pub fn ema_update(&mut self, observation: f64, alpha: f64) {
        self.q = ema(self.q, observation, alpha);
        self.t = ema(self.t, observation, alpha);
        self.r = ema(self.r, observation, alpha);
        self.s = ema(self.s, observation, alpha);
        self.v = ema(self.v, observation, alpha);
        self.i = ema(self.i, observation, alpha);
        self.e = ema(self.e, observation, alpha);
    }
}

fn ema(current: f64, observation: f64, alpha: f64) -> f64 {
    alpha * observation + (1.0 - alpha) * current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_class_grouping() {
        assert!(AttestationType::Accepted.is_accept_class());
        assert!(AttestationType::AuditPass.is_accept_class());
        assert!(!AttestationType::Rejected.is_accept_class());
        assert!(!AttestationType::AuditFail.is_accept_class());
    }

    #[test]
    fn ema_moves_toward_observation() {
        let mut dims = ReputationDimensions::default();
        dims.ema_update(1.0, 0.2);
        assert!((dims.q - 0.2).abs() < 1e-12);
        dims.ema_update(1.0, 0.2);
        assert!((dims.q - 0.36).abs() < 1e-12);
    }
}
