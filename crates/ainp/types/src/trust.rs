use serde::{Deserialize, Serialize};

/// Default per-day decay multiplier (≈30-day half-life).
pub const TRUST_DECAY_RATE_DEFAULT: f64 = 0.977;

/// Per-agent trust in four dimensions, each in [0, 1].
///
/// The aggregate weights reliability and honesty most heavily; decay is
/// applied on read from the record's last update time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustVector {
    pub reliability: f64,
    pub honesty: f64,
    pub competence: f64,
    pub timeliness: f64,
}

impl TrustVector {
    /// Linear aggregate: reliability·0.35 + honesty·0.35 + competence·0.20 +
    /// timeliness·0.10.
    pub fn aggregate(&self) -> f64 {
        self.reliability * 0.35
            + self.honesty * 0.35
            + self.competence * 0.20
            + self.timeliness * 0.10
    }

    /// Aggregate with exponential decay applied for `days_since_update`.
    pub fn decayed_score(&self, decay_rate: f64, days_since_update: f64) -> f64 {
        self.aggregate() * decay_rate.powf(days_since_update.max(0.0))
    }
}

impl Default for TrustVector {
    fn default() -> Self {
        Self {
            reliability: 0.5,
            honesty: 0.5,
            competence: 0.5,
            timeliness: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_weighting() {
        let v = TrustVector {
            reliability: 1.0,
            honesty: 0.0,
            competence: 0.0,
            timeliness: 0.0,
        };
        assert!((v.aggregate() - 0.35).abs() < 1e-12);

        let uniform = TrustVector {
            reliability: 0.8,
            honesty: 0.8,
            competence: 0.8,
            timeliness: 0.8,
        };
        assert!((uniform.aggregate() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn decay_halves_in_about_thirty_days() {
        let v = TrustVector {
            reliability: 1.0,
            honesty: 1.0,
            competence: 1.0,
            timeliness: 1.0,
        };
        let decayed = v.decayed_score(TRUST_DECAY_RATE_DEFAULT, 30.0);
        assert!(decayed > 0.47 && decayed < 0.53);
    }

    #[test]
    fn negative_elapsed_does_not_inflate() {
        let v = TrustVector::default();
        assert!((v.decayed_score(TRUST_DECAY_RATE_DEFAULT, -5.0) - v.aggregate()).abs() < 1e-12);
    }
}
