//! Anti-fraud guard: four independent checks on the send path.
//!
//! Replay rejection and content dedupe ride on atomic set-if-absent cache
//! keys; the greylist denies first contact until the recipient allows the
//! sender or the sender pays postage, which mints a one-shot bypass token
//! for the replay window. Every check is gated by its own flag and returns
//! a typed denial.

#![deny(unsafe_code)]

use ainp_cache::BrokerCache;
use ainp_crypto::sha256_hex;
use ainp_ledger::{CreditLedger, LedgerError};
use ainp_mailbox::ContactService;
use ainp_storage::ConsentState;
use ainp_types::{Did, Envelope, EnvelopeId, MsgType};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for guard checks.
pub type GuardResult<T> = Result<T, GuardError>;

/// Guard configuration. Each sub-check has its own flag.
#[derive(Clone, Debug)]
pub struct GuardConfig {
    pub replay_enabled: bool,
    /// Replay window; also bounds bypass-token lifetime.
    pub replay_ttl: Duration,
    pub content_dedupe_enabled: bool,
    pub content_dedupe_ttl: Duration,
    pub greylist_enabled: bool,
    pub greylist_retry_after_secs: u64,
    /// `GREYLIST_BYPASS_PAYMENT_ENABLED`
    pub postage_enabled: bool,
    /// Atomic credits pre-spent to bypass the greylist.
    pub postage_cost: i64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            replay_enabled: true,
            replay_ttl: Duration::from_secs(300),
            content_dedupe_enabled: true,
            content_dedupe_ttl: Duration::from_secs(3600),
            greylist_enabled: true,
            greylist_retry_after_secs: 60,
            postage_enabled: true,
            postage_cost: 10_000,
        }
    }
}

/// The anti-fraud guard.
pub struct FraudGuard {
    cache: Arc<dyn BrokerCache>,
    contacts: Arc<ContactService>,
    ledger: Arc<CreditLedger>,
    pool_did: Did,
    config: GuardConfig,
}

impl FraudGuard {
    pub fn new(
        cache: Arc<dyn BrokerCache>,
        contacts: Arc<ContactService>,
        ledger: Arc<CreditLedger>,
        pool_did: Did,
        config: GuardConfig,
    ) -> Self {
        Self {
            cache,
            contacts,
            ledger,
            pool_did,
            config,
        }
    }

    /// Replay rejection: `(envelope id, sender, trace)` is one-shot inside
    /// the replay window.
    pub async fn check_replay(&self, envelope: &Envelope) -> GuardResult<()> {
        if !self.config.replay_enabled {
            return Ok(());
        }
        let key = replay_key(&envelope.from_did, &envelope.id, &envelope.trace_id);
        let fresh = self
            .cache
            .set_nx(&key, "1", self.config.replay_ttl)
            .await
            .map_err(|e| GuardError::Backend(e.to_string()))?;
        if !fresh {
            return Err(GuardError::DuplicateEnvelope(envelope.id.clone()));
        }
        Ok(())
    }

    /// Email facet checks: content dedupe, then the greylist with its
    /// consent and postage-bypass short circuits.
    pub async fn check_email(&self, envelope: &Envelope, recipient: &Did) -> GuardResult<()> {
        if envelope.msg_type != MsgType::EmailMessage {
            return Ok(());
        }

        if self.config.content_dedupe_enabled {
            let body = normalized_body(envelope);
            let key = format!(
                "dedupe:{}",
                sha256_hex(
                    format!("{}|{}|{}", envelope.from_did, recipient, body).as_bytes()
                )
            );
            let fresh = self
                .cache
                .set_nx(&key, "1", self.config.content_dedupe_ttl)
                .await
                .map_err(|e| GuardError::Backend(e.to_string()))?;
            if !fresh {
                return Err(GuardError::DuplicateContent);
            }
        }

        if self.config.greylist_enabled {
            self.check_greylist(envelope, recipient).await?;
        }
        Ok(())
    }

    async fn check_greylist(&self, envelope: &Envelope, recipient: &Did) -> GuardResult<()> {
        let consent = self
            .contacts
            .consent_of(recipient, &envelope.from_did)
            .await
            .map_err(|e| GuardError::Backend(e.to_string()))?;

        match consent {
            ConsentState::Blocked => Err(GuardError::SenderBlocked),
            ConsentState::Allowed => Ok(()),
            ConsentState::Unknown => {
                let token = bypass_key(&envelope.from_did, recipient, &envelope.id);
                let redeemed = self
                    .cache
                    .get(&token)
                    .await
                    .map_err(|e| GuardError::Backend(e.to_string()))?
                    .is_some();
                if redeemed {
                    // One-shot: consume the token and open the edge.
                    if let Err(e) = self.cache.delete(&token).await {
                        tracing::warn!(error = %e, "failed to consume postage token");
                    }
                    self.contacts
                        .allow(recipient, &envelope.from_did)
                        .await
                        .map_err(|e| GuardError::Backend(e.to_string()))?;
                    return Ok(());
                }
                Err(GuardError::Greylisted {
                    retry_after_secs: self.config.greylist_retry_after_secs,
                })
            }
        }
    }

    /// Pre-spend postage and mint the one-shot bypass token for this
    /// `(sender, recipient, envelope)` triple.
    pub async fn pay_postage(
        &self,
        sender: &Did,
        recipient: &Did,
        envelope_id: &EnvelopeId,
    ) -> GuardResult<i64> {
        if !self.config.postage_enabled {
            return Err(GuardError::PostageDisabled);
        }

        let cost = self.config.postage_cost;
        self.ledger
            .charge(sender, cost, Some(envelope_id.0.as_str()))
            .await
            .map_err(|e| match e {
                LedgerError::InsufficientBalance { requested, .. } => {
                    GuardError::PostageRequired { amount: requested }
                }
                LedgerError::AccountNotFound(_) => GuardError::PostageRequired { amount: cost },
                other => GuardError::Backend(other.to_string()),
            })?;
        // Postage accrues to the community pool.
        self.ledger
            .earn(&self.pool_did, cost, Some(envelope_id.0.as_str()), None)
            .await
            .map_err(|e| GuardError::Backend(e.to_string()))?;

        let token = bypass_key(sender, recipient, envelope_id);
        self.cache
            .set(&token, "paid", self.config.replay_ttl)
            .await
            .map_err(|e| GuardError::Backend(e.to_string()))?;

        tracing::info!(%sender, %recipient, envelope = %envelope_id, cost, "postage accepted");
        Ok(cost)
    }
}

fn replay_key(from: &Did, id: &EnvelopeId, trace_id: &str) -> String {
    format!("replay:{}", sha256_hex(format!("{id}|{from}|{trace_id}").as_bytes()))
}

fn bypass_key(from: &Did, to: &Did, id: &EnvelopeId) -> String {
    format!("postage:{}", sha256_hex(format!("{from}|{to}|{id}").as_bytes()))
}

/// Body text normalized for dedupe: lowercase, whitespace collapsed.
fn normalized_body(envelope: &Envelope) -> String {
    let body = envelope
        .payload
        .get("body")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    body.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Guard denials and failures.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("duplicate envelope: {0}")]
    DuplicateEnvelope(EnvelopeId),

    #[error("duplicate content")]
    DuplicateContent,

    #[error("greylisted: first contact requires consent or postage")]
    Greylisted { retry_after_secs: u64 },

    #[error("sender is blocked by the recipient")]
    SenderBlocked,

    #[error("postage of {amount} credits required")]
    PostageRequired { amount: i64 },

    #[error("postage bypass is disabled")]
    PostageDisabled,

    #[error("guard backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_cache::InMemoryCache;
    use ainp_storage::memory::InMemoryBrokerStorage;
    use ainp_types::TaggedValue;

    fn did(s: &str) -> Did {
        Did::parse(s).unwrap()
    }

    fn email(from: &Did, to: &Did, id: &str, body: &str) -> Envelope {
        Envelope {
            id: EnvelopeId(id.to_string()),
            trace_id: format!("trace-{id}"),
            from_did: from.clone(),
            to_did: Some(to.clone()),
            msg_type: MsgType::EmailMessage,
            ttl_seconds: 300,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            signature: String::new(),
            payload: TaggedValue::from(serde_json::json!({"body": body})),
        }
    }

    struct Fixture {
        guard: FraudGuard,
        contacts: Arc<ContactService>,
        ledger: Arc<CreditLedger>,
    }

    fn fixture(config: GuardConfig) -> Fixture {
        let storage = Arc::new(InMemoryBrokerStorage::new());
        let cache = Arc::new(InMemoryCache::new());
        let contacts = Arc::new(ContactService::new(storage.clone()));
        let ledger = Arc::new(CreditLedger::new(storage));
        let guard = FraudGuard::new(
            cache,
            contacts.clone(),
            ledger.clone(),
            did("did:key:pool"),
            config,
        );
        Fixture {
            guard,
            contacts,
            ledger,
        }
    }

    #[tokio::test]
    async fn second_identical_envelope_is_a_replay() {
        let f = fixture(GuardConfig::default());
        let sender = did("did:key:aa");
        let env = email(&sender, &did("did:key:bb"), "e-1", "hi");

        f.guard.check_replay(&env).await.unwrap();
        assert!(matches!(
            f.guard.check_replay(&env).await,
            Err(GuardError::DuplicateEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn disabled_replay_check_passes_everything() {
        let f = fixture(GuardConfig {
            replay_enabled: false,
            ..Default::default()
        });
        let env = email(&did("did:key:aa"), &did("did:key:bb"), "e-1", "hi");
        f.guard.check_replay(&env).await.unwrap();
        f.guard.check_replay(&env).await.unwrap();
    }

    #[tokio::test]
    async fn same_body_to_same_recipient_is_duplicate_content() {
        let f = fixture(GuardConfig {
            greylist_enabled: false,
            ..Default::default()
        });
        let sender = did("did:key:aa");
        let recipient = did("did:key:bb");

        let first = email(&sender, &recipient, "e-1", "Buy   Now");
        let second = email(&sender, &recipient, "e-2", "buy now");
        f.guard.check_email(&first, &recipient).await.unwrap();
        assert!(matches!(
            f.guard.check_email(&second, &recipient).await,
            Err(GuardError::DuplicateContent)
        ));
    }

    #[tokio::test]
    async fn first_contact_is_greylisted_with_retry_after() {
        let f = fixture(GuardConfig {
            content_dedupe_enabled: false,
            ..Default::default()
        });
        let sender = did("did:key:aa");
        let recipient = did("did:key:bb");
        let env = email(&sender, &recipient, "e-1", "hello");

        match f.guard.check_email(&env, &recipient).await {
            Err(GuardError::Greylisted { retry_after_secs }) => {
                assert!(retry_after_secs >= 60);
            }
            other => panic!("expected greylist denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn allowed_contact_skips_the_greylist() {
        let f = fixture(GuardConfig {
            content_dedupe_enabled: false,
            ..Default::default()
        });
        let sender = did("did:key:aa");
        let recipient = did("did:key:bb");
        f.contacts.allow(&recipient, &sender).await.unwrap();

        let env = email(&sender, &recipient, "e-1", "hello");
        f.guard.check_email(&env, &recipient).await.unwrap();
    }

    #[tokio::test]
    async fn blocked_sender_is_denied() {
        let f = fixture(GuardConfig {
            content_dedupe_enabled: false,
            ..Default::default()
        });
        let sender = did("did:key:aa");
        let recipient = did("did:key:bb");
        f.contacts.block(&recipient, &sender).await.unwrap();

        let env = email(&sender, &recipient, "e-1", "hello");
        assert!(matches!(
            f.guard.check_email(&env, &recipient).await,
            Err(GuardError::SenderBlocked)
        ));
    }

    #[tokio::test]
    async fn postage_bypasses_greylist_and_opens_consent() {
        let f = fixture(GuardConfig {
            content_dedupe_enabled: false,
            postage_cost: 500,
            ..Default::default()
        });
        let sender = did("did:key:aa");
        let recipient = did("did:key:bb");
        f.ledger.create_account(&sender, 1_000).await.unwrap();
        f.ledger.create_account(&did("did:key:pool"), 0).await.unwrap();

        let env = email(&sender, &recipient, "e-1", "hello");
        assert!(matches!(
            f.guard.check_email(&env, &recipient).await,
            Err(GuardError::Greylisted { .. })
        ));

        let cost = f.guard.pay_postage(&sender, &recipient, &env.id).await.unwrap();
        assert_eq!(cost, 500);
        assert_eq!(f.ledger.get_account(&sender).await.unwrap().balance, 500);
        assert_eq!(
            f.ledger.get_account(&did("did:key:pool")).await.unwrap().balance,
            500
        );

        // Second attempt delivers and the edge opens.
        f.guard.check_email(&env, &recipient).await.unwrap();
        assert_eq!(
            f.contacts.consent_of(&recipient, &sender).await.unwrap(),
            ConsentState::Allowed
        );
    }

    #[tokio::test]
    async fn postage_without_funds_is_payment_required() {
        let f = fixture(GuardConfig {
            postage_cost: 500,
            ..Default::default()
        });
        let sender = did("did:key:aa");
        f.ledger.create_account(&sender, 10).await.unwrap();

        assert!(matches!(
            f.guard
                .pay_postage(&sender, &did("did:key:bb"), &EnvelopeId("e-1".to_string()))
                .await,
            Err(GuardError::PostageRequired { .. })
        ));
    }

    #[tokio::test]
    async fn non_email_envelopes_skip_the_email_facet() {
        let f = fixture(GuardConfig::default());
        let sender = did("did:key:aa");
        let recipient = did("did:key:bb");
        let mut env = email(&sender, &recipient, "e-1", "hello");
        env.msg_type = MsgType::Intent;
        f.guard.check_email(&env, &recipient).await.unwrap();
    }
}
