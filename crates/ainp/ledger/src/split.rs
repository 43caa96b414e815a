use crate::{CreditLedger, LedgerError, LedgerResult};
use ainp_types::{Did, IncentiveSplit};
use std::sync::Arc;

/// Inputs for one settled-amount distribution.
#[derive(Clone, Debug)]
pub struct DistributionRequest {
    pub intent_id: String,
    pub total_amount: i64,
    pub agent_did: Did,
    pub broker_did: Option<Did>,
    pub validator_did: Option<Did>,
    pub incentive_split: IncentiveSplit,
    pub usefulness_proof_id: Option<String>,
}

/// The bit-exact outcome: shares always sum to `total_amount`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Distribution {
    pub agent: i64,
    pub broker: i64,
    pub validator: i64,
    pub pool: i64,
}

/// Splits settled amounts and credits each recipient through the ledger.
///
/// Named shares are floored; the pool receives the rounding remainder plus
/// any share whose recipient DID is absent, so the distribution is exact.
pub struct IncentiveDistributor {
    ledger: Arc<CreditLedger>,
    pool_did: Did,
}

impl IncentiveDistributor {
    pub fn new(ledger: Arc<CreditLedger>, pool_did: Did) -> Self {
        Self { ledger, pool_did }
    }

    pub fn pool_did(&self) -> &Did {
        &self.pool_did
    }

    /// Compute the split without touching any account.
    pub fn compute(request: &DistributionRequest) -> LedgerResult<Distribution> {
        request
            .incentive_split
            .validate()
            .map_err(|e| LedgerError::InvalidSplit(e.to_string()))?;
        if request.total_amount < 0 {
            return Err(LedgerError::InvalidAmount(request.total_amount));
        }

        let total = request.total_amount;
        let floor_share = |share: f64| (total as f64 * share).floor() as i64;

        let agent = floor_share(request.incentive_split.agent);
        let broker = if request.broker_did.is_some() {
            floor_share(request.incentive_split.broker)
        } else {
            0
        };
        let validator = if request.validator_did.is_some() {
            floor_share(request.incentive_split.validator)
        } else {
            0
        };
        let pool = total - agent - broker - validator;

        Ok(Distribution {
            agent,
            broker,
            validator,
            pool,
        })
    }

    /// Split and credit. Each non-zero share earns into its recipient's
    /// account; missing recipients collapse into the pool.
    pub async fn distribute(&self, request: &DistributionRequest) -> LedgerResult<Distribution> {
        let distribution = Self::compute(request)?;
        let intent_id = Some(request.intent_id.as_str());
        let proof_id = request.usefulness_proof_id.as_deref();

        if distribution.agent > 0 {
            self.ledger
                .earn(&request.agent_did, distribution.agent, intent_id, proof_id)
                .await?;
        }
        if distribution.broker > 0 {
            if let Some(broker) = &request.broker_did {
                self.ledger
                    .earn(broker, distribution.broker, intent_id, None)
                    .await?;
            }
        }
        if distribution.validator > 0 {
            if let Some(validator) = &request.validator_did {
                self.ledger
                    .earn(validator, distribution.validator, intent_id, None)
                    .await?;
            }
        }
        if distribution.pool > 0 {
            self.ledger
                .earn(&self.pool_did, distribution.pool, intent_id, None)
                .await?;
        }

        tracing::debug!(
            intent_id = %request.intent_id,
            total = request.total_amount,
            agent = distribution.agent,
            broker = distribution.broker,
            validator = distribution.validator,
            pool = distribution.pool,
            "distributed settled amount"
        );
        Ok(distribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_storage::memory::InMemoryBrokerStorage;

    fn did(s: &str) -> Did {
        Did::parse(s).unwrap()
    }

    fn split(agent: f64, broker: f64, validator: f64, pool: f64) -> IncentiveSplit {
        IncentiveSplit {
            agent,
            broker,
            validator,
            pool,
        }
    }

    async fn distributor() -> (IncentiveDistributor, Arc<CreditLedger>) {
        let ledger = Arc::new(CreditLedger::new(Arc::new(InMemoryBrokerStorage::new())));
        let pool = did("did:key:pool");
        ledger.create_account(&pool, 0).await.unwrap();
        (IncentiveDistributor::new(ledger.clone(), pool), ledger)
    }

    fn request(total: i64) -> DistributionRequest {
        DistributionRequest {
            intent_id: "i-1".to_string(),
            total_amount: total,
            agent_did: did("did:key:agent"),
            broker_did: Some(did("did:key:broker")),
            validator_did: Some(did("did:key:validator")),
            incentive_split: split(0.7, 0.1, 0.1, 0.1),
            usefulness_proof_id: None,
        }
    }

    #[test]
    fn remainder_lands_in_the_pool() {
        let d = IncentiveDistributor::compute(&request(100_001)).unwrap();
        assert_eq!(d.agent, 70_000);
        assert_eq!(d.broker, 10_000);
        assert_eq!(d.validator, 10_000);
        assert_eq!(d.pool, 10_001);
        assert_eq!(d.agent + d.broker + d.validator + d.pool, 100_001);
    }

    #[test]
    fn small_totals_floor_into_the_pool() {
        let d = IncentiveDistributor::compute(&request(10)).unwrap();
        assert_eq!((d.agent, d.broker, d.validator, d.pool), (7, 1, 1, 1));
    }

    #[test]
    fn absent_recipients_collapse_into_the_pool() {
        let mut req = request(100_000);
        req.broker_did = None;
        req.validator_did = None;
        let d = IncentiveDistributor::compute(&req).unwrap();
        assert_eq!(d.agent, 70_000);
        assert_eq!(d.broker, 0);
        assert_eq!(d.validator, 0);
        assert_eq!(d.pool, 30_000);
    }

    #[test]
    fn invalid_split_is_rejected() {
        let mut req = request(100);
        req.incentive_split = split(0.7, 0.2, 0.2, 0.1);
        assert!(matches!(
            IncentiveDistributor::compute(&req),
            Err(LedgerError::InvalidSplit(_))
        ));
    }

    #[tokio::test]
    async fn distribute_credits_every_recipient() {
        let (distributor, ledger) = distributor().await;
        let req = request(100_001);
        for recipient in ["did:key:agent", "did:key:broker", "did:key:validator"] {
            ledger.create_account(&did(recipient), 0).await.unwrap();
        }

        let d = distributor.distribute(&req).await.unwrap();
        assert_eq!(d.agent + d.broker + d.validator + d.pool, 100_001);

        assert_eq!(
            ledger.get_account(&did("did:key:agent")).await.unwrap().balance,
            70_000
        );
        assert_eq!(
            ledger.get_account(&did("did:key:pool")).await.unwrap().balance,
            10_001
        );
        assert_eq!(
            ledger
                .get_account(&did("did:key:agent"))
                .await
                .unwrap()
                .lifetime_earned,
            70_000
        );
    }
}
