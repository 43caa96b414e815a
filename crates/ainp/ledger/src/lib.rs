//! Credit ledger facade and incentive distribution.
//!
//! All balance math happens inside the storage backend under a per-account
//! lock; this crate validates amounts, maps storage failures onto the
//! ledger's error taxonomy, and splits settled totals across agent, broker,
//! validator, and the community pool.

#![deny(unsafe_code)]

mod split;

pub use split::{Distribution, DistributionRequest, IncentiveDistributor};

use ainp_storage::{AccountRecord, AccountStore, LedgerEntryRecord, QueryWindow, StorageError};
use ainp_types::Did;
use std::sync::Arc;
use thiserror::Error;

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// The broker's credit ledger.
///
/// Deposits, reservations, releases, and earnings all journal through the
/// account store; every transition is serialized per account.
pub struct CreditLedger {
    storage: Arc<dyn AccountStore>,
}

impl CreditLedger {
    pub fn new(storage: Arc<dyn AccountStore>) -> Self {
        Self { storage }
    }

    /// Idempotent account creation.
    pub async fn create_account(
        &self,
        did: &Did,
        initial_balance: i64,
    ) -> LedgerResult<AccountRecord> {
        if initial_balance < 0 {
            return Err(LedgerError::InvalidAmount(initial_balance));
        }
        self.storage
            .create_account(did, initial_balance)
            .await
            .map_err(LedgerError::from)
    }

    pub async fn get_account(&self, did: &Did) -> LedgerResult<AccountRecord> {
        self.storage
            .get_account(did)
            .await
            .map_err(LedgerError::from)?
            .ok_or_else(|| LedgerError::AccountNotFound(did.clone()))
    }

    pub async fn deposit(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> LedgerResult<AccountRecord> {
        Self::require_positive(amount)?;
        self.storage
            .deposit(did, amount, intent_id)
            .await
            .map_err(LedgerError::from)
    }

    /// Move credits from balance into escrow.
    pub async fn reserve(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> LedgerResult<AccountRecord> {
        Self::require_positive(amount)?;
        self.storage
            .reserve(did, amount, intent_id)
            .await
            .map_err(LedgerError::from)
    }

    /// Release an escrowed amount, spending part (or all) of it and
    /// refunding the remainder to balance.
    pub async fn release(
        &self,
        did: &Did,
        reserved_amount: i64,
        spend_amount: i64,
        intent_id: Option<&str>,
    ) -> LedgerResult<AccountRecord> {
        Self::require_positive(reserved_amount)?;
        if spend_amount < 0 || spend_amount > reserved_amount {
            return Err(LedgerError::InvalidAmount(spend_amount));
        }
        self.storage
            .release(did, reserved_amount, spend_amount, intent_id)
            .await
            .map_err(LedgerError::from)
    }

    pub async fn earn(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
        proof_id: Option<&str>,
    ) -> LedgerResult<AccountRecord> {
        Self::require_positive(amount)?;
        self.storage
            .earn(did, amount, intent_id, proof_id)
            .await
            .map_err(LedgerError::from)
    }

    /// Direct spend from balance (postage pre-spend).
    pub async fn charge(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> LedgerResult<AccountRecord> {
        Self::require_positive(amount)?;
        self.storage
            .charge(did, amount, intent_id)
            .await
            .map_err(LedgerError::from)
    }

    pub async fn list_entries(
        &self,
        did: &Did,
        window: QueryWindow,
    ) -> LedgerResult<Vec<LedgerEntryRecord>> {
        self.storage
            .list_entries(did, window)
            .await
            .map_err(LedgerError::from)
    }

    fn require_positive(amount: i64) -> LedgerResult<()> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        Ok(())
    }
}

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("account not found: {0}")]
    AccountNotFound(Did),

    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("insufficient reserved: requested {requested}, reserved {reserved}")]
    InsufficientReserved { requested: i64, reserved: i64 },

    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("invalid incentive split: {0}")]
    InvalidSplit(String),

    #[error("ledger backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for LedgerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(what) => match Did::parse(
                what.trim_start_matches("account "),
            ) {
                Ok(did) => Self::AccountNotFound(did),
                Err(_) => Self::Backend(what),
            },
            StorageError::InsufficientBalance {
                requested,
                available,
            } => Self::InsufficientBalance {
                requested,
                available,
            },
            StorageError::InsufficientReserved {
                requested,
                reserved,
            } => Self::InsufficientReserved {
                requested,
                reserved,
            },
            StorageError::InvalidInput(msg) => Self::Backend(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_storage::memory::InMemoryBrokerStorage;
    use proptest::prelude::*;

    fn did(s: &str) -> Did {
        Did::parse(s).unwrap()
    }

    fn ledger() -> CreditLedger {
        CreditLedger::new(Arc::new(InMemoryBrokerStorage::new()))
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let ledger = ledger();
        let owner = did("did:key:aa");
        let first = ledger.create_account(&owner, 500).await.unwrap();
        let second = ledger.create_account(&owner, 9_999).await.unwrap();
        assert_eq!(first.balance, 500);
        assert_eq!(second.balance, 500);
    }

    #[tokio::test]
    async fn reserve_then_full_release_spends_everything() {
        let ledger = ledger();
        let owner = did("did:key:aa");
        ledger.create_account(&owner, 1_000_000).await.unwrap();

        let after_reserve = ledger.reserve(&owner, 100_000, Some("i-1")).await.unwrap();
        assert_eq!(after_reserve.balance, 900_000);
        assert_eq!(after_reserve.reserved, 100_000);

        let settled = ledger.release(&owner, 100_000, 100_000, Some("i-1")).await.unwrap();
        assert_eq!(settled.balance, 900_000);
        assert_eq!(settled.reserved, 0);
        assert_eq!(settled.lifetime_spent, 100_000);
    }

    #[tokio::test]
    async fn release_refunds_unspent_portion() {
        let ledger = ledger();
        let owner = did("did:key:aa");
        ledger.create_account(&owner, 1_000).await.unwrap();
        ledger.reserve(&owner, 600, None).await.unwrap();

        let account = ledger.release(&owner, 600, 150, None).await.unwrap();
        assert_eq!(account.balance, 850);
        assert_eq!(account.reserved, 0);
        assert_eq!(account.lifetime_spent, 150);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let ledger = ledger();
        let owner = did("did:key:aa");
        ledger.create_account(&owner, 100).await.unwrap();

        assert!(matches!(
            ledger.deposit(&owner, 0, None).await,
            Err(LedgerError::InvalidAmount(0))
        ));
        assert!(matches!(
            ledger.reserve(&owner, -5, None).await,
            Err(LedgerError::InvalidAmount(-5))
        ));
        assert!(matches!(
            ledger.release(&owner, 10, 11, None).await,
            Err(LedgerError::InvalidAmount(11))
        ));
    }

    #[tokio::test]
    async fn unknown_account_surfaces_typed_error() {
        let ledger = ledger();
        assert!(matches!(
            ledger.deposit(&did("did:key:ghost"), 10, None).await,
            Err(LedgerError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn insufficient_balance_maps_through() {
        let ledger = ledger();
        let owner = did("did:key:aa");
        ledger.create_account(&owner, 10).await.unwrap();
        assert!(matches!(
            ledger.reserve(&owner, 100, None).await,
            Err(LedgerError::InsufficientBalance {
                requested: 100,
                available: 10
            })
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deposit(i64),
        Reserve(i64),
        ReleaseAll,
        Earn(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
        proptest::collection::vec(
            prop_oneof![
                (1i64..10_000).prop_map(Op::Deposit),
                (1i64..10_000).prop_map(Op::Reserve),
                Just(Op::ReleaseAll),
                (1i64..10_000).prop_map(Op::Earn),
            ],
            0..24,
        )
    }

    proptest! {
        #[test]
        fn property_balance_never_negative_and_journal_reconciles(ops in op_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async move {
                let ledger = ledger();
                let owner = did("did:key:prop");
                ledger.create_account(&owner, 0).await.expect("account");

                for op in ops {
                    let result = match op {
                        Op::Deposit(amount) => ledger.deposit(&owner, amount, None).await,
                        Op::Reserve(amount) => ledger.reserve(&owner, amount, None).await,
                        Op::ReleaseAll => {
                            let account = ledger.get_account(&owner).await.expect("account");
                            if account.reserved > 0 {
                                ledger.release(&owner, account.reserved, account.reserved, None).await
                            } else {
                                Ok(account)
                            }
                        }
                        Op::Earn(amount) => ledger.earn(&owner, amount, None, None).await,
                    };
                    // Rejections are fine; silent corruption is not.
                    if let Ok(account) = result {
                        assert!(account.balance >= 0);
                        assert!(account.reserved >= 0);
                    }
                }

                let account = ledger.get_account(&owner).await.expect("account");
                let entries = ledger
                    .list_entries(&owner, QueryWindow::default())
                    .await
                    .expect("entries");

                let mut balance = 0i64;
                let mut reserved = 0i64;
                for entry in &entries {
                    match entry.entry_type {
                        ainp_storage::LedgerEntryType::Deposit
                        | ainp_storage::LedgerEntryType::Earn => balance += entry.amount,
                        ainp_storage::LedgerEntryType::Reserve => {
                            balance -= entry.amount;
                            reserved += entry.amount;
                        }
                        ainp_storage::LedgerEntryType::Release => {
                            balance += entry.amount;
                            reserved -= entry.amount;
                        }
                        ainp_storage::LedgerEntryType::Spend => reserved -= entry.amount,
                    }
                }
                // The spend entries written by `charge` debit balance, not
                // reserve, but this property only drives escrow spends.
                assert_eq!(balance, account.balance);
                assert_eq!(reserved, account.reserved);
            });
        }
    }
}
