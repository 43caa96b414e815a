//! Configuration for the AINP broker daemon.

use ainp_discovery::RankingWeights;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cache backend
    #[serde(default)]
    pub cache: CacheConfig,

    /// Embedding upstream
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Discovery ranking
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Routing pipeline
    #[serde(default)]
    pub router: RouterSettings,

    /// Anti-fraud guard
    #[serde(default)]
    pub guard: GuardSettings,

    /// Negotiation defaults
    #[serde(default)]
    pub negotiation: NegotiationSettings,

    /// Well-known broker identities
    #[serde(default)]
    pub identity: IdentitySettings,

    /// Background job intervals
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Feature flags
    #[serde(default)]
    pub features: FeatureFlags,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            embedding: EmbeddingConfig::default(),
            discovery: DiscoverySettings::default(),
            router: RouterSettings::default(),
            guard: GuardSettings::default(),
            negotiation: NegotiationSettings::default(),
            identity: IdentitySettings::default(),
            jobs: JobsConfig::default(),
            features: FeatureFlags::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().expect("valid default address"),
            enable_cors: true,
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (development/testing)
    Memory,

    /// PostgreSQL with pgvector
    Postgres {
        url: String,

        #[serde(default = "default_pool_size")]
        max_connections: u32,

        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Cache backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheConfig {
    /// In-memory cache (development/testing)
    Memory,

    /// Redis
    Redis { url: String },
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory
    }
}

/// Embedding upstream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_embedding_concurrency")]
    pub max_concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            api_key: String::new(),
            model: "text-embedding-3-small".to_string(),
            max_concurrency: 32,
        }
    }
}

/// Discovery ranking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
    #[serde(default = "default_trust_weight")]
    pub trust_weight: f64,
    #[serde(default = "default_usefulness_weight")]
    pub usefulness_weight: f64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default = "default_result_cache_secs")]
    pub result_cache_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            similarity_weight: default_similarity_weight(),
            trust_weight: default_trust_weight(),
            usefulness_weight: default_usefulness_weight(),
            max_candidates: default_max_candidates(),
            min_similarity: default_min_similarity(),
            result_cache_secs: default_result_cache_secs(),
        }
    }
}

impl DiscoverySettings {
    pub fn weights(&self) -> RankingWeights {
        RankingWeights {
            similarity: self.similarity_weight,
            trust: self.trust_weight,
            usefulness: self.usefulness_weight,
        }
    }
}

/// Routing pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_fanout")]
    pub broadcast_fanout: usize,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: default_rate_limit(),
            broadcast_fanout: default_fanout(),
            publish_attempts: default_publish_attempts(),
        }
    }
}

/// Anti-fraud guard settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardSettings {
    #[serde(default = "default_true")]
    pub replay_enabled: bool,
    #[serde(default = "default_replay_ttl")]
    pub replay_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub content_dedupe_enabled: bool,
    #[serde(default = "default_dedupe_ttl")]
    pub content_dedupe_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub greylist_enabled: bool,
    #[serde(default = "default_retry_after")]
    pub greylist_retry_after_secs: u64,
    #[serde(default = "default_postage_cost")]
    pub postage_cost: i64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            replay_enabled: true,
            replay_ttl_secs: default_replay_ttl(),
            content_dedupe_enabled: true,
            content_dedupe_ttl_secs: default_dedupe_ttl(),
            greylist_enabled: true,
            greylist_retry_after_secs: default_retry_after(),
            postage_cost: default_postage_cost(),
        }
    }
}

/// Negotiation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSettings {
    #[serde(default = "default_max_rounds")]
    pub default_max_rounds: u32,
    #[serde(default = "default_ttl_minutes")]
    pub default_ttl_minutes: i64,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            default_max_rounds: default_max_rounds(),
            default_ttl_minutes: default_ttl_minutes(),
        }
    }
}

/// Well-known broker identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySettings {
    /// Community pool account; receives rounding remainders and postage.
    pub pool_did: String,
    /// The broker's own settlement account.
    #[serde(default)]
    pub broker_did: Option<String>,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            pool_did: "did:key:ainp-community-pool".to_string(),
            broker_did: None,
        }
    }
}

/// Background job intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_expiry_interval")]
    pub negotiation_expiry_secs: u64,
    #[serde(default = "default_refresh_interval")]
    pub usefulness_refresh_secs: u64,
    #[serde(default = "default_finalize_interval")]
    pub receipt_finalize_secs: u64,
    #[serde(default = "default_payment_interval")]
    pub payment_expiry_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            negotiation_expiry_secs: default_expiry_interval(),
            usefulness_refresh_secs: default_refresh_interval(),
            receipt_finalize_secs: default_finalize_interval(),
            payment_expiry_secs: default_payment_interval(),
        }
    }
}

/// Feature flags. A disabled flag returns 503 on its routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub messaging_enabled: bool,
    #[serde(default = "default_true")]
    pub negotiation_enabled: bool,
    #[serde(default = "default_true")]
    pub credit_ledger_enabled: bool,
    #[serde(default = "default_true")]
    pub usefulness_aggregation_enabled: bool,
    #[serde(default = "default_true")]
    pub payments_enabled: bool,
    #[serde(default = "default_true")]
    pub web4_pou_discovery_enabled: bool,
    #[serde(default = "default_true")]
    pub greylist_bypass_payment_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            messaging_enabled: true,
            negotiation_enabled: true,
            credit_ledger_enabled: true,
            usefulness_aggregation_enabled: true,
            payments_enabled: true,
            web4_pou_discovery_enabled: true,
            greylist_bypass_payment_enabled: true,
        }
    }
}

impl FeatureFlags {
    /// Apply the well-known flag environment variables on top of whatever
    /// the config sources produced.
    fn apply_env(&mut self) {
        let toggles: [(&str, &mut bool); 7] = [
            ("MESSAGING_ENABLED", &mut self.messaging_enabled),
            ("NEGOTIATION_ENABLED", &mut self.negotiation_enabled),
            ("CREDIT_LEDGER_ENABLED", &mut self.credit_ledger_enabled),
            (
                "USEFULNESS_AGGREGATION_ENABLED",
                &mut self.usefulness_aggregation_enabled,
            ),
            ("PAYMENTS_ENABLED", &mut self.payments_enabled),
            (
                "WEB4_POU_DISCOVERY_ENABLED",
                &mut self.web4_pou_discovery_enabled,
            ),
            (
                "GREYLIST_BYPASS_PAYMENT_ENABLED",
                &mut self.greylist_bypass_payment_enabled,
            ),
        ];
        for (name, flag) in toggles {
            if let Ok(value) = std::env::var(name) {
                *flag = matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "on");
            }
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_embedding_concurrency() -> usize {
    32
}

fn default_similarity_weight() -> f64 {
    0.6
}

fn default_trust_weight() -> f64 {
    0.3
}

fn default_usefulness_weight() -> f64 {
    0.1
}

fn default_max_candidates() -> usize {
    50
}

fn default_min_similarity() -> f64 {
    0.7
}

fn default_result_cache_secs() -> u64 {
    300
}

fn default_rate_limit() -> u32 {
    100
}

fn default_fanout() -> usize {
    5
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_replay_ttl() -> u64 {
    300
}

fn default_dedupe_ttl() -> u64 {
    3600
}

fn default_retry_after() -> u64 {
    60
}

fn default_postage_cost() -> i64 {
    10_000
}

fn default_max_rounds() -> u32 {
    10
}

fn default_ttl_minutes() -> i64 {
    60
}

fn default_expiry_interval() -> u64 {
    30
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_finalize_interval() -> u64 {
    60
}

fn default_payment_interval() -> u64 {
    60
}

impl BrokerConfig {
    /// Load configuration: defaults, then an optional file, then `AINP_`
    /// environment variables, then the well-known feature-flag variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&BrokerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("AINP")
                .separator("__")
                .try_parsing(true),
        );

        let mut loaded: BrokerConfig = builder.build()?.try_deserialize()?;
        loaded.features.apply_env();
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_development_friendly() {
        let config = BrokerConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert!(matches!(config.cache, CacheConfig::Memory));
        assert!(config.features.messaging_enabled);
        assert_eq!(config.router.rate_limit_per_minute, 100);
        assert_eq!(config.router.broadcast_fanout, 5);
    }

    #[test]
    fn discovery_defaults_match_canonical_weights() {
        let weights = DiscoverySettings::default().weights();
        assert_eq!(weights.similarity, 0.6);
        assert_eq!(weights.trust, 0.3);
        assert_eq!(weights.usefulness, 0.1);
    }
}
