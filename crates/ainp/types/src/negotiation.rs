use crate::{Did, TaggedValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Multiplier from external token price units to atomic credit units.
pub const ATOMIC_CREDITS_PER_TOKEN: f64 = 1000.0;

/// Negotiation session states. `Accepted`, `Rejected`, and `Expired` are
/// sinks: no transition leaves them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Initiated,
    Proposed,
    CounterProposed,
    Accepted,
    Rejected,
    Expired,
}

impl NegotiationState {
    pub fn is_sink(&self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Proposed => "proposed",
            Self::CounterProposed => "counter_proposed",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

/// Negotiation terms. The three recognized numeric keys drive convergence
/// scoring; everything else rides in `custom_terms`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_sla: Option<f64>,
    #[serde(default)]
    pub custom_terms: BTreeMap<String, TaggedValue>,
}

impl Proposal {
    /// Price converted to atomic credit units, rounded to the nearest unit.
    pub fn price_atomic(&self) -> Option<i64> {
        self.price.map(|p| (p * ATOMIC_CREDITS_PER_TOKEN).round() as i64)
    }

    fn numeric_terms(&self) -> [(&'static str, Option<f64>); 3] {
        [
            ("price", self.price),
            ("delivery_time_ms", self.delivery_time_ms),
            ("quality_sla", self.quality_sla),
        ]
    }

    /// Convergence between two proposals: for each numeric key present in
    /// both, `1 - |a-b| / max(|a|,|b|,ε)`, averaged; 0 when nothing is
    /// comparable.
    pub fn convergence_with(&self, other: &Proposal) -> f64 {
        const EPSILON: f64 = 1e-9;

        let mut total = 0.0;
        let mut count = 0usize;
        for ((_, a), (_, b)) in self.numeric_terms().into_iter().zip(other.numeric_terms()) {
            if let (Some(a), Some(b)) = (a, b) {
                let denom = a.abs().max(b.abs()).max(EPSILON);
                total += 1.0 - (a - b).abs() / denom;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }
}

/// One appended negotiation round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    pub round_number: u32,
    pub proposer_did: Did,
    pub proposal: Proposal,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub convergence_delta: f64,
}

/// Fractions dividing a settled amount across agent, broker, validator, and
/// the community pool. Must sum to 1.0 within tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncentiveSplit {
    pub agent: f64,
    pub broker: f64,
    pub validator: f64,
    pub pool: f64,
}

impl IncentiveSplit {
    pub const SUM_TOLERANCE: f64 = 1e-6;

    pub fn validate(&self) -> Result<(), SplitError> {
        let parts = [self.agent, self.broker, self.validator, self.pool];
        if parts.iter().any(|p| *p < 0.0 || !p.is_finite()) {
            return Err(SplitError::NegativeShare);
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > Self::SUM_TOLERANCE {
            return Err(SplitError::DoesNotSumToOne(sum));
        }
        Ok(())
    }
}

impl Default for IncentiveSplit {
    fn default() -> Self {
        Self {
            agent: 0.7,
            broker: 0.1,
            validator: 0.1,
            pool: 0.1,
        }
    }
}

/// Invalid incentive split.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("split shares must sum to 1.0, got {0}")]
    DoesNotSumToOne(f64),

    #[error("split shares must be non-negative and finite")]
    NegativeShare,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(price: Option<f64>, delivery: Option<f64>, quality: Option<f64>) -> Proposal {
        Proposal {
            price,
            delivery_time_ms: delivery,
            quality_sla: quality,
            custom_terms: BTreeMap::new(),
        }
    }

    #[test]
    fn sink_states() {
        assert!(NegotiationState::Accepted.is_sink());
        assert!(NegotiationState::Rejected.is_sink());
        assert!(NegotiationState::Expired.is_sink());
        assert!(!NegotiationState::CounterProposed.is_sink());
    }

    #[test]
    fn convergence_over_shared_keys_only() {
        let a = terms(Some(100.0), Some(1000.0), None);
        let b = terms(Some(90.0), None, Some(0.9));
        // Only price is shared: 1 - 10/100 = 0.9.
        let score = a.convergence_with(&b);
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn convergence_zero_when_nothing_comparable() {
        let a = terms(Some(100.0), None, None);
        let b = terms(None, Some(5.0), None);
        assert_eq!(a.convergence_with(&b), 0.0);
    }

    #[test]
    fn identical_proposals_fully_converge() {
        let a = terms(Some(50.0), Some(2000.0), Some(0.99));
        assert!((a.convergence_with(&a.clone()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn price_atomic_multiplies_by_1000() {
        assert_eq!(terms(Some(100.0), None, None).price_atomic(), Some(100_000));
        assert_eq!(terms(Some(0.0015), None, None).price_atomic(), Some(2));
        assert_eq!(terms(None, None, None).price_atomic(), None);
    }

    #[test]
    fn split_validation() {
        assert!(IncentiveSplit::default().validate().is_ok());
        let bad = IncentiveSplit {
            agent: 0.7,
            broker: 0.2,
            validator: 0.2,
            pool: 0.1,
        };
        assert!(matches!(
            bad.validate(),
            Err(SplitError::DoesNotSumToOne(_))
        ));
        let negative = IncentiveSplit {
            agent: 1.2,
            broker: -0.2,
            validator: 0.0,
            pool: 0.0,
        };
        assert!(matches!(negative.validate(), Err(SplitError::NegativeShare)));
    }
}
