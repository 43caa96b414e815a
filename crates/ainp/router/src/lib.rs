//! Intent routing pipeline.
//!
//! One ordered stack per envelope, short-circuiting on the first failure:
//! structural/signature validation, identity equality, replay rejection,
//! email guards, rate limiting, then dispatch. Unicast goes to the named
//! recipient; broadcast runs discovery and fans out to the top N, with the
//! broker rewriting `to_did` before each publish. Successful deliveries
//! persist a mailbox record, touch the contact edge, and notify live
//! sessions; failures persist nothing.

#![deny(unsafe_code)]

use ainp_cache::BrokerCache;
use ainp_crypto::{EnvelopeValidator, ValidationError};
use ainp_delivery::SessionRegistry;
use ainp_discovery::{DiscoveryEngine, DiscoveryError, DiscoveryQuery};
use ainp_guard::{FraudGuard, GuardError};
use ainp_mailbox::{ContactService, MailboxService};
use ainp_stream::{intents_subject, IntentStream};
use ainp_types::{Did, Envelope, Notification};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for routing.
pub type RouterResult<T> = Result<T, RouterError>;

/// Router knobs.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Sliding-window rate limit per sender per minute.
    pub rate_limit_per_minute: u32,
    /// Broadcast fan-out: top N discovery hits receive the intent.
    pub broadcast_fanout: usize,
    /// Publish attempts before surfacing a stream failure.
    pub publish_attempts: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 100,
            broadcast_fanout: 5,
            publish_attempts: 3,
        }
    }
}

/// One inbound send request.
#[derive(Clone, Debug)]
pub struct SendRequest {
    pub envelope: Envelope,
    /// Outer identity assertion (`X-AINP-DID`); must match the envelope.
    pub asserted_did: Option<Did>,
    /// Rate-limit key for unauthenticated callers.
    pub client_ip: Option<String>,
    /// Broadcast recipient selection; required when `to_did` is absent.
    pub query: Option<DiscoveryQuery>,
}

/// Successful routing summary.
#[derive(Clone, Debug)]
pub struct RouteOutcome {
    pub agent_count: usize,
    /// True when the rate limiter failed open because the cache was down.
    pub degraded: bool,
}

/// The intent router.
pub struct IntentRouter {
    validator: Arc<EnvelopeValidator>,
    guard: Arc<FraudGuard>,
    cache: Arc<dyn BrokerCache>,
    discovery: Arc<DiscoveryEngine>,
    stream: Arc<dyn IntentStream>,
    mailbox: Arc<MailboxService>,
    contacts: Arc<ContactService>,
    sessions: Arc<SessionRegistry>,
    config: RouterConfig,
}

impl IntentRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        validator: Arc<EnvelopeValidator>,
        guard: Arc<FraudGuard>,
        cache: Arc<dyn BrokerCache>,
        discovery: Arc<DiscoveryEngine>,
        stream: Arc<dyn IntentStream>,
        mailbox: Arc<MailboxService>,
        contacts: Arc<ContactService>,
        sessions: Arc<SessionRegistry>,
        config: RouterConfig,
    ) -> Self {
        Self {
            validator,
            guard,
            cache,
            discovery,
            stream,
            mailbox,
            contacts,
            sessions,
            config,
        }
    }

    /// Run the full pipeline for one envelope.
    pub async fn send(&self, request: SendRequest) -> RouterResult<RouteOutcome> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let envelope = &request.envelope;

        // 1–2. Structure, signature, identity equality.
        let validated = self
            .validator
            .validate(envelope, request.asserted_did.as_ref(), now_ms)
            .await?;

        // 3. Replay.
        self.guard.check_replay(envelope).await?;

        // 4. Email facet for the named recipient (broadcast recipients are
        //    checked individually during fan-out).
        if let Some(recipient) = &envelope.to_did {
            self.check_email_with_postage(envelope, recipient).await?;
        }

        // 5. Rate limit, keyed by sender DID or client IP. Fails open when
        //    the cache is down.
        let degraded = self.check_rate_limit(&validated.sender, request.client_ip.as_deref()).await?;

        // 6. Dispatch.
        let recipients = match &envelope.to_did {
            Some(recipient) => vec![recipient.clone()],
            None => self.select_broadcast_recipients(&request).await?,
        };

        let mut delivered = 0;
        for recipient in &recipients {
            match self.deliver_one(envelope, recipient).await {
                Ok(()) => delivered += 1,
                Err(e) if envelope.to_did.is_some() => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        recipient = %recipient,
                        error = %e,
                        "skipping broadcast recipient"
                    );
                }
            }
        }

        tracing::info!(
            envelope = %envelope.id,
            sender = %validated.sender,
            agent_count = delivered,
            degraded,
            "intent routed"
        );
        Ok(RouteOutcome {
            agent_count: delivered,
            degraded,
        })
    }

    /// Email guard with the postage bypass: a greylisted sender carrying a
    /// `postage: true` payload marker pre-spends and retries once.
    async fn check_email_with_postage(
        &self,
        envelope: &Envelope,
        recipient: &Did,
    ) -> RouterResult<()> {
        match self.guard.check_email(envelope, recipient).await {
            Err(GuardError::Greylisted { retry_after_secs }) => {
                let wants_postage = envelope
                    .payload
                    .get("postage")
                    .and_then(|v| match v {
                        ainp_types::TaggedValue::Bool(b) => Some(*b),
                        _ => None,
                    })
                    .unwrap_or(false);
                if !wants_postage {
                    return Err(GuardError::Greylisted { retry_after_secs }.into());
                }
                self.guard
                    .pay_postage(&envelope.from_did, recipient, &envelope.id)
                    .await?;
                Ok(self.guard.check_email(envelope, recipient).await?)
            }
            other => Ok(other?),
        }
    }

    async fn check_rate_limit(
        &self,
        sender: &Did,
        client_ip: Option<&str>,
    ) -> RouterResult<bool> {
        let key = match client_ip {
            Some(ip) => format!("rate:ip:{ip}"),
            None => format!("rate:{sender}"),
        };
        match self
            .cache
            .sliding_window_allow(&key, self.config.rate_limit_per_minute, Duration::from_secs(60))
            .await
        {
            Ok(decision) if decision.allowed => Ok(false),
            Ok(decision) => Err(RouterError::RateLimited {
                reset_at_ms: decision.reset_at_ms,
            }),
            // Never fail closed on rate limits because a dependency is down.
            Err(e) => {
                tracing::warn!(error = %e, "rate limiter degraded; allowing request");
                Ok(true)
            }
        }
    }

    async fn select_broadcast_recipients(
        &self,
        request: &SendRequest,
    ) -> RouterResult<Vec<Did>> {
        let query = request.query.clone().ok_or_else(|| {
            RouterError::Validation(ValidationError::InvalidStructure(
                "broadcast envelopes require a discovery query".to_string(),
            ))
        })?;

        let hits = self.discovery.search(&query).await?;
        Ok(hits
            .into_iter()
            .map(|hit| hit.agent_did)
            .filter(|did| did != &request.envelope.from_did)
            .take(self.config.broadcast_fanout)
            .collect())
    }

    async fn deliver_one(&self, envelope: &Envelope, recipient: &Did) -> RouterResult<()> {
        // Broadcast recipients get their own email-facet check.
        if envelope.to_did.is_none() {
            self.guard.check_email(envelope, recipient).await?;
        }

        // The broker rewrites the recipient before publish.
        let mut rewritten = envelope.clone();
        rewritten.to_did = Some(recipient.clone());

        self.publish_with_retry(&rewritten, recipient).await?;

        let (record, _) = self
            .mailbox
            .store_envelope(&rewritten, recipient)
            .await
            .map_err(|e| RouterError::Backend(e.to_string()))?;

        if let Err(e) = self
            .contacts
            .record_interaction(recipient, &envelope.from_did)
            .await
        {
            tracing::warn!(error = %e, "failed to record contact interaction");
        }

        // 7. Live notification.
        self.sessions.push(
            recipient,
            Notification::NewMessage {
                message_id: record.id.to_string(),
                conversation_id: record.conversation_id.clone(),
                from_did: envelope.from_did.clone(),
            },
        );
        Ok(())
    }

    async fn publish_with_retry(&self, envelope: &Envelope, recipient: &Did) -> RouterResult<()> {
        let subject = intents_subject(recipient);
        let mut backoff = Duration::from_millis(100);
        let mut last_error = None;

        for attempt in 0..self.config.publish_attempts.max(1) {
            match self.stream.publish(&subject, envelope).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        subject = %subject,
                        attempt = attempt + 1,
                        error = %e,
                        "stream publish failed"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        Err(RouterError::PublishFailed(
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

/// Routing errors, ordered by pipeline stage.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("rate limited")]
    RateLimited { reset_at_ms: i64 },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("durable publish failed: {0}")]
    PublishFailed(String),

    #[error("routing backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_cache::{CacheError, CacheResult, InMemoryCache, RateDecision};
    use ainp_crypto::{AgentKeypair, KeyResolver};
    use ainp_discovery::DiscoveryConfig;
    use ainp_embedding::{Embedder, EmbeddingResult};
    use ainp_guard::GuardConfig;
    use ainp_ledger::CreditLedger;
    use ainp_stream::InMemoryIntentStream;
    use ainp_storage::memory::InMemoryBrokerStorage;
    use ainp_storage::{
        AgentRecord, AgentStore, CapabilityRecord, ContactStore, MailboxStore, TrustRecord,
    };
    use ainp_types::{EnvelopeId, MsgType, TaggedValue, TrustVector};
    use async_trait::async_trait;
    use ed25519_dalek::VerifyingKey;

    struct NoResolver;

    #[async_trait]
    impl KeyResolver for NoResolver {
        async fn resolve(&self, _did: &Did) -> Result<Option<VerifyingKey>, ValidationError> {
            Ok(None)
        }
    }

    struct UnitEmbedder;

    #[async_trait]
    impl Embedder for UnitEmbedder {
        async fn embed(&self, _text: &str) -> EmbeddingResult<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0, 0.0, 0.0]; texts.len()])
        }
    }

    /// Cache stub whose sliding window always errors, as if redis is down.
    struct DownCache {
        inner: InMemoryCache,
    }

    #[async_trait]
    impl BrokerCache for DownCache {
        async fn get(&self, key: &str) -> CacheResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
            self.inner.set_nx(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> CacheResult<()> {
            self.inner.delete(key).await
        }
        async fn incr(&self, key: &str) -> CacheResult<i64> {
            self.inner.incr(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
            self.inner.expire(key, ttl).await
        }
        async fn sliding_window_allow(
            &self,
            _key: &str,
            _limit: u32,
            _window: Duration,
        ) -> CacheResult<RateDecision> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
        async fn cache_embedding(&self, text_hash: &str, vector: &[f32]) -> CacheResult<()> {
            self.inner.cache_embedding(text_hash, vector).await
        }
        async fn lookup_embedding(&self, text_hash: &str) -> CacheResult<Option<Vec<f32>>> {
            self.inner.lookup_embedding(text_hash).await
        }
        async fn ping(&self) -> CacheResult<()> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    struct Fixture {
        router: IntentRouter,
        storage: Arc<InMemoryBrokerStorage>,
        sessions: Arc<SessionRegistry>,
        ledger: Arc<CreditLedger>,
    }

    fn build_fixture(cache: Arc<dyn BrokerCache>, config: RouterConfig) -> Fixture {
        let storage = Arc::new(InMemoryBrokerStorage::new());
        let validator = Arc::new(EnvelopeValidator::new(Arc::new(NoResolver)));
        let contacts = Arc::new(ContactService::new(storage.clone()));
        let ledger = Arc::new(CreditLedger::new(storage.clone()));
        let guard = Arc::new(FraudGuard::new(
            cache.clone(),
            contacts.clone(),
            ledger.clone(),
            Did::parse("did:key:pool").unwrap(),
            GuardConfig::default(),
        ));
        let discovery = Arc::new(DiscoveryEngine::new(
            Arc::new(UnitEmbedder),
            storage.clone(),
            cache.clone(),
            DiscoveryConfig {
                min_similarity: 0.5,
                ..Default::default()
            },
        ));
        let stream: Arc<dyn IntentStream> = Arc::new(InMemoryIntentStream::default());
        let mailbox = Arc::new(MailboxService::new(storage.clone()));
        let sessions = Arc::new(SessionRegistry::new());

        let router = IntentRouter::new(
            validator,
            guard,
            cache,
            discovery,
            stream,
            mailbox,
            contacts,
            sessions.clone(),
            config,
        );
        Fixture {
            router,
            storage,
            sessions,
            ledger,
        }
    }

    fn signed(kp: &AgentKeypair, to: Option<&Did>, msg_type: MsgType, id: &str) -> Envelope {
        let mut env = Envelope {
            id: EnvelopeId(id.to_string()),
            trace_id: format!("trace-{id}"),
            from_did: kp.did(),
            to_did: to.cloned(),
            msg_type,
            ttl_seconds: 300,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            signature: String::new(),
            payload: TaggedValue::from(serde_json::json!({"goal": "do work"})),
        };
        kp.sign_envelope(&mut env).unwrap();
        env
    }

    fn unicast_request(kp: &AgentKeypair, to: &Did, id: &str) -> SendRequest {
        SendRequest {
            envelope: signed(kp, Some(to), MsgType::Intent, id),
            asserted_did: Some(kp.did()),
            client_ip: None,
            query: None,
        }
    }

    async fn seed_capable_agent(storage: &InMemoryBrokerStorage, did_str: &str, similarity: f32) {
        let agent_did = Did::parse(did_str).unwrap();
        let now = chrono::Utc::now();
        storage
            .upsert_agent(AgentRecord {
                did: agent_did.clone(),
                endpoint: None,
                public_key_hex: None,
                ttl_seconds: 3600,
                usefulness_cached: 0.0,
                usefulness_updated_at: None,
                registered_at: now,
                last_seen: now,
            })
            .await
            .unwrap();
        storage
            .upsert_trust(TrustRecord {
                agent_did: agent_did.clone(),
                vector: TrustVector::default(),
                decay_rate: 0.977,
                updated_at: now,
            })
            .await
            .unwrap();
        let orthogonal = (1.0 - similarity * similarity).sqrt();
        storage
            .replace_capabilities(
                &agent_did,
                vec![CapabilityRecord {
                    id: uuid::Uuid::new_v4(),
                    agent_did: agent_did.clone(),
                    description: "does work".to_string(),
                    embedding: vec![similarity, orthogonal, 0.0],
                    tags: vec![],
                    version: "1.0.0".to_string(),
                    credential_ref: None,
                    updated_at: now,
                }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unicast_persists_notifies_and_counts_one() {
        let f = build_fixture(Arc::new(InMemoryCache::new()), RouterConfig::default());
        let kp = AgentKeypair::generate();
        let recipient = Did::parse("did:key:bb").unwrap();
        let mut rx = f.sessions.subscribe(&recipient);

        let outcome = f
            .router
            .send(unicast_request(&kp, &recipient, "e-1"))
            .await
            .unwrap();
        assert_eq!(outcome.agent_count, 1);
        assert!(!outcome.degraded);

        let inbox = f
            .storage
            .list_inbox(&recipient, Default::default())
            .await
            .unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].envelope_id, "e-1");

        let frame = rx.try_recv().unwrap();
        assert!(matches!(
            frame,
            ainp_delivery::SessionFrame::Notification(Notification::NewMessage { .. })
        ));

        let contact = f
            .storage
            .get_contact(&recipient, &kp.did())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.interaction_count, 1);
    }

    #[tokio::test]
    async fn replayed_envelope_is_rejected_second_time() {
        let f = build_fixture(Arc::new(InMemoryCache::new()), RouterConfig::default());
        let kp = AgentKeypair::generate();
        let recipient = Did::parse("did:key:bb").unwrap();

        let request = unicast_request(&kp, &recipient, "e-1");
        f.router.send(request.clone()).await.unwrap();
        assert!(matches!(
            f.router.send(request).await,
            Err(RouterError::Guard(GuardError::DuplicateEnvelope(_)))
        ));

        // The duplicate did not persist a second mailbox record.
        let inbox = f
            .storage
            .list_inbox(&recipient, Default::default())
            .await
            .unwrap();
        assert_eq!(inbox.len(), 1);
    }

    #[tokio::test]
    async fn asserted_did_mismatch_fails_before_any_side_effect() {
        let f = build_fixture(Arc::new(InMemoryCache::new()), RouterConfig::default());
        let kp = AgentKeypair::generate();
        let recipient = Did::parse("did:key:bb").unwrap();

        let mut request = unicast_request(&kp, &recipient, "e-1");
        request.asserted_did = Some(Did::parse("did:key:someoneelse").unwrap());
        assert!(matches!(
            f.router.send(request).await,
            Err(RouterError::Validation(ValidationError::DidMismatch { .. }))
        ));

        let inbox = f
            .storage
            .list_inbox(&recipient, Default::default())
            .await
            .unwrap();
        assert!(inbox.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_denies_past_the_window_limit() {
        let f = build_fixture(
            Arc::new(InMemoryCache::new()),
            RouterConfig {
                rate_limit_per_minute: 3,
                ..Default::default()
            },
        );
        let kp = AgentKeypair::generate();
        let recipient = Did::parse("did:key:bb").unwrap();

        for i in 0..3 {
            f.router
                .send(unicast_request(&kp, &recipient, &format!("e-{i}")))
                .await
                .unwrap();
        }
        match f
            .router
            .send(unicast_request(&kp, &recipient, "e-overflow"))
            .await
        {
            Err(RouterError::RateLimited { reset_at_ms }) => assert!(reset_at_ms > 0),
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cache_outage_fails_open_with_degraded_marker() {
        let f = build_fixture(
            Arc::new(DownCache {
                inner: InMemoryCache::new(),
            }),
            RouterConfig::default(),
        );
        let kp = AgentKeypair::generate();
        let recipient = Did::parse("did:key:bb").unwrap();

        let outcome = f
            .router
            .send(unicast_request(&kp, &recipient, "e-1"))
            .await
            .unwrap();
        assert_eq!(outcome.agent_count, 1);
        assert!(outcome.degraded);
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_top_n_excluding_sender() {
        let f = build_fixture(
            Arc::new(InMemoryCache::new()),
            RouterConfig {
                broadcast_fanout: 2,
                ..Default::default()
            },
        );
        let kp = AgentKeypair::generate();
        seed_capable_agent(&f.storage, "did:key:aa", 0.99).await;
        seed_capable_agent(&f.storage, "did:key:bb", 0.95).await;
        seed_capable_agent(&f.storage, "did:key:cc", 0.90).await;

        let request = SendRequest {
            envelope: signed(&kp, None, MsgType::Intent, "e-b1"),
            asserted_did: Some(kp.did()),
            client_ip: None,
            query: Some(DiscoveryQuery {
                description: "does work".to_string(),
                ..Default::default()
            }),
        };
        let outcome = f.router.send(request).await.unwrap();
        assert_eq!(outcome.agent_count, 2);

        // Top two by similarity got their rewritten copies.
        for recipient in ["did:key:aa", "did:key:bb"] {
            let inbox = f
                .storage
                .list_inbox(&Did::parse(recipient).unwrap(), Default::default())
                .await
                .unwrap();
            assert_eq!(inbox.len(), 1, "missing copy for {recipient}");
        }
        let inbox = f
            .storage
            .list_inbox(&Did::parse("did:key:cc").unwrap(), Default::default())
            .await
            .unwrap();
        assert!(inbox.is_empty());
    }

    #[tokio::test]
    async fn broadcast_without_query_is_invalid() {
        let f = build_fixture(Arc::new(InMemoryCache::new()), RouterConfig::default());
        let kp = AgentKeypair::generate();
        let request = SendRequest {
            envelope: signed(&kp, None, MsgType::Intent, "e-b1"),
            asserted_did: Some(kp.did()),
            client_ip: None,
            query: None,
        };
        assert!(matches!(
            f.router.send(request).await,
            Err(RouterError::Validation(ValidationError::InvalidStructure(_)))
        ));
    }

    #[tokio::test]
    async fn greylisted_email_surfaces_retry_after() {
        let f = build_fixture(Arc::new(InMemoryCache::new()), RouterConfig::default());
        let kp = AgentKeypair::generate();
        let recipient = Did::parse("did:key:bb").unwrap();

        let mut env = signed(&kp, Some(&recipient), MsgType::EmailMessage, "e-1");
        env.payload = TaggedValue::from(serde_json::json!({"body": "hello there"}));
        kp.sign_envelope(&mut env).unwrap();

        let request = SendRequest {
            envelope: env,
            asserted_did: Some(kp.did()),
            client_ip: None,
            query: None,
        };
        match f.router.send(request).await {
            Err(RouterError::Guard(GuardError::Greylisted { retry_after_secs })) => {
                assert!(retry_after_secs >= 60)
            }
            other => panic!("expected greylist, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn postage_marker_buys_through_the_greylist() {
        let f = build_fixture(Arc::new(InMemoryCache::new()), RouterConfig::default());
        let kp = AgentKeypair::generate();
        let recipient = Did::parse("did:key:bb").unwrap();
        f.ledger.create_account(&kp.did(), 100_000).await.unwrap();
        f.ledger
            .create_account(&Did::parse("did:key:pool").unwrap(), 0)
            .await
            .unwrap();

        let mut env = signed(&kp, Some(&recipient), MsgType::EmailMessage, "e-1");
        env.payload =
            TaggedValue::from(serde_json::json!({"body": "hello there", "postage": true}));
        kp.sign_envelope(&mut env).unwrap();

        let outcome = f
            .router
            .send(SendRequest {
                envelope: env,
                asserted_did: Some(kp.did()),
                client_ip: None,
                query: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome.agent_count, 1);

        // Postage was charged and the edge opened.
        let account = f.ledger.get_account(&kp.did()).await.unwrap();
        assert!(account.lifetime_spent > 0);
        let contact = f
            .storage
            .get_contact(&recipient, &kp.did())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.consent, ainp_storage::ConsentState::Allowed);
    }
}
