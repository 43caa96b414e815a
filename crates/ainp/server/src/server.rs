//! Server setup and lifecycle management.

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::config::{BrokerConfig, CacheConfig, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::jobs::spawn_jobs;
use crate::resolver::StorageKeyResolver;
use ainp_cache::{BrokerCache, InMemoryCache, RedisCache};
use ainp_crypto::EnvelopeValidator;
use ainp_delivery::{ConsumerBridge, SessionRegistry};
use ainp_discovery::{DiscoveryConfig, DiscoveryEngine};
use ainp_embedding::{Embedder, EmbeddingConfig, HttpEmbeddingClient};
use ainp_guard::{FraudGuard, GuardConfig};
use ainp_ledger::{CreditLedger, IncentiveDistributor};
use ainp_mailbox::{ContactService, MailboxService};
use ainp_negotiation::{NegotiationConfig, NegotiationService};
use ainp_reputation::{ReceiptConfig, ReceiptService};
use ainp_router::{IntentRouter, RouterConfig};
use ainp_storage::memory::InMemoryBrokerStorage;
use ainp_storage::BrokerStorage;
use ainp_stream::{InMemoryIntentStream, IntentStream};
use ainp_types::Did;
use ainp_usefulness::UsefulnessAggregator;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// The AINP broker server.
pub struct Server {
    config: BrokerConfig,
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Wire every engine to its collaborators per the configuration.
    pub async fn new(config: BrokerConfig) -> DaemonResult<Self> {
        let storage = build_storage(&config.storage).await?;
        let cache = build_cache(&config.cache)?;
        let stream: Arc<dyn IntentStream> = Arc::new(InMemoryIntentStream::default());

        let pool_did = Did::parse(&config.identity.pool_did)
            .map_err(|e| DaemonError::Config(format!("invalid pool DID: {e}")))?;
        let broker_did = config
            .identity
            .broker_did
            .as_deref()
            .map(Did::parse)
            .transpose()
            .map_err(|e| DaemonError::Config(format!("invalid broker DID: {e}")))?;

        let embedder: Arc<dyn Embedder> = Arc::new(
            HttpEmbeddingClient::new(
                EmbeddingConfig {
                    endpoint: config.embedding.endpoint.clone(),
                    api_key: config.embedding.api_key.clone(),
                    model: config.embedding.model.clone(),
                    max_concurrency: config.embedding.max_concurrency,
                },
                cache.clone(),
            )
            .map_err(|e| DaemonError::Config(e.to_string()))?,
        );

        let validator = Arc::new(EnvelopeValidator::new(Arc::new(StorageKeyResolver::new(
            storage.clone(),
        ))));
        let mailbox = Arc::new(MailboxService::new(storage.clone()));
        let contacts = Arc::new(ContactService::new(storage.clone()));
        let ledger = Arc::new(CreditLedger::new(storage.clone()));
        let distributor = Arc::new(IncentiveDistributor::new(ledger.clone(), pool_did.clone()));

        let guard = Arc::new(FraudGuard::new(
            cache.clone(),
            contacts.clone(),
            ledger.clone(),
            pool_did.clone(),
            GuardConfig {
                replay_enabled: config.guard.replay_enabled,
                replay_ttl: Duration::from_secs(config.guard.replay_ttl_secs),
                content_dedupe_enabled: config.guard.content_dedupe_enabled,
                content_dedupe_ttl: Duration::from_secs(config.guard.content_dedupe_ttl_secs),
                greylist_enabled: config.guard.greylist_enabled,
                greylist_retry_after_secs: config.guard.greylist_retry_after_secs,
                postage_enabled: config.features.greylist_bypass_payment_enabled,
                postage_cost: config.guard.postage_cost,
            },
        ));

        let discovery = Arc::new(DiscoveryEngine::new(
            embedder.clone(),
            storage.clone(),
            cache.clone(),
            DiscoveryConfig {
                weights: config.discovery.weights(),
                combined_ranking_enabled: config.features.web4_pou_discovery_enabled,
                max_candidates: config.discovery.max_candidates,
                min_similarity: config.discovery.min_similarity,
                result_cache_ttl: Duration::from_secs(config.discovery.result_cache_secs),
            },
        ));

        let receipts = Arc::new(ReceiptService::new(
            storage.clone(),
            storage.clone(),
            ReceiptConfig::default(),
        ));
        let negotiations = Arc::new(NegotiationService::new(
            storage.clone(),
            ledger.clone(),
            distributor,
            receipts.clone(),
            NegotiationConfig {
                default_max_rounds: config.negotiation.default_max_rounds,
                default_ttl_minutes: config.negotiation.default_ttl_minutes,
                broker_did: broker_did.clone(),
            },
        ));
        let usefulness = Arc::new(UsefulnessAggregator::new(storage.clone(), storage.clone()));

        let sessions = Arc::new(SessionRegistry::new());
        let bridge = ConsumerBridge::new(stream.clone(), sessions.clone());

        let router = Arc::new(IntentRouter::new(
            validator,
            guard.clone(),
            cache.clone(),
            discovery.clone(),
            stream.clone(),
            mailbox.clone(),
            contacts.clone(),
            sessions.clone(),
            RouterConfig {
                rate_limit_per_minute: config.router.rate_limit_per_minute,
                broadcast_fanout: config.router.broadcast_fanout,
                publish_attempts: config.router.publish_attempts,
            },
        ));

        // Well-known accounts exist from boot.
        ledger
            .create_account(&pool_did, 0)
            .await
            .map_err(|e| DaemonError::Storage(e.to_string()))?;
        if let Some(broker_did) = &broker_did {
            ledger
                .create_account(broker_did, 0)
                .await
                .map_err(|e| DaemonError::Storage(e.to_string()))?;
        }

        let (shutdown_tx, _) = watch::channel(false);
        let state = AppState {
            storage,
            cache,
            stream,
            embedder,
            router,
            discovery,
            mailbox,
            contacts,
            ledger,
            guard,
            negotiations,
            usefulness,
            receipts,
            sessions,
            bridge,
            features: config.features.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now(),
        };

        Ok(Self {
            config,
            state,
            shutdown_tx,
        })
    }

    /// Handlers and jobs share this state; exposed for integration tests.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the server until SIGINT/SIGTERM.
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;

        spawn_jobs(
            self.state.clone(),
            self.config.jobs.clone(),
            self.shutdown_tx.subscribe(),
        );

        let app = create_router(self.state.clone(), self.config.server.enable_cors);
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("AINP broker listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        tracing::info!("AINP broker shutting down");
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }
}

async fn build_storage(config: &StorageConfig) -> DaemonResult<Arc<dyn BrokerStorage>> {
    match config {
        StorageConfig::Memory => {
            Ok(Arc::new(InMemoryBrokerStorage::new()) as Arc<dyn BrokerStorage>)
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            let storage = ainp_storage::postgres::PostgresBrokerStorage::connect_with_options(
                url,
                *max_connections,
                *connect_timeout_secs,
            )
            .await
            .map_err(|e| DaemonError::Storage(e.to_string()))?;
            Ok(Arc::new(storage) as Arc<dyn BrokerStorage>)
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(DaemonError::Config(
            "postgres storage requires the `postgres` build feature".to_string(),
        )),
    }
}

fn build_cache(config: &CacheConfig) -> DaemonResult<Arc<dyn BrokerCache>> {
    match config {
        CacheConfig::Memory => Ok(Arc::new(InMemoryCache::new())),
        CacheConfig::Redis { url } => {
            let cache = RedisCache::connect(url).map_err(|e| DaemonError::Config(e.to_string()))?;
            Ok(Arc::new(cache))
        }
    }
}


/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("received terminate signal, initiating graceful shutdown");
        }
    }
}
