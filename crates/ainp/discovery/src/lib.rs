//! Semantic discovery: embedding-backed nearest-neighbor search combined
//! with trust and usefulness weighting.
//!
//! The hot path reads only cached usefulness scores and applies trust decay
//! on read; results are cached for a short TTL under a hash of the
//! normalized query. When the embedding upstream is down, discovery fails —
//! it never ranks on fabricated vectors.

#![deny(unsafe_code)]

use ainp_cache::BrokerCache;
use ainp_crypto::sha256_hex;
use ainp_embedding::{Embedder, EmbeddingError};
use ainp_storage::{AgentStore, CapabilitySearchHit};
use ainp_types::Did;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Combined-ranking weights. Defaults are (0.6, 0.3, 0.1).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RankingWeights {
    pub similarity: f64,
    pub trust: f64,
    pub usefulness: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            similarity: 0.6,
            trust: 0.3,
            usefulness: 0.1,
        }
    }
}

/// Discovery engine knobs.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub weights: RankingWeights,
    /// When off, ranking falls back to pure similarity.
    pub combined_ranking_enabled: bool,
    pub max_candidates: usize,
    pub min_similarity: f64,
    pub result_cache_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            weights: RankingWeights::default(),
            combined_ranking_enabled: true,
            max_candidates: 50,
            min_similarity: 0.7,
            result_cache_ttl: Duration::from_secs(300),
        }
    }
}

/// A discovery request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_trust: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
    /// Pre-computed query embedding; skips the embed call when present.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

/// One ranked discovery hit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryHit {
    pub agent_did: Did,
    pub description: String,
    pub tags: Vec<String>,
    pub version: String,
    pub similarity: f64,
    pub trust_score: f64,
    pub usefulness_score: f64,
    pub combined_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_updated_at: Option<DateTime<Utc>>,
}

/// The discovery engine.
pub struct DiscoveryEngine {
    embedder: Arc<dyn Embedder>,
    storage: Arc<dyn AgentStore>,
    cache: Arc<dyn BrokerCache>,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        storage: Arc<dyn AgentStore>,
        cache: Arc<dyn BrokerCache>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            embedder,
            storage,
            cache,
            config,
        }
    }

    /// Ranked search per the combined-ranking procedure. Cached results are
    /// served first; cache entries never outlive their TTL.
    pub async fn search(&self, query: &DiscoveryQuery) -> DiscoveryResult<Vec<DiscoveryHit>> {
        if query.description.trim().is_empty() {
            return Err(DiscoveryError::InvalidQuery(
                "description is required".to_string(),
            ));
        }

        let cache_key = self.cache_key(query);
        if let Ok(Some(cached)) = self.cache.get(&cache_key).await {
            if let Ok(hits) = serde_json::from_str::<Vec<DiscoveryHit>>(&cached) {
                tracing::debug!(key = %cache_key, "discovery cache hit");
                return Ok(hits);
            }
        }

        let embedding = match &query.embedding {
            Some(embedding) => embedding.clone(),
            None => self.embedder.embed(&query.description).await.map_err(|e| match e {
                EmbeddingError::EmptyInput => {
                    DiscoveryError::InvalidQuery("description is required".to_string())
                }
                other => DiscoveryError::EmbeddingUnavailable(other.to_string()),
            })?,
        };

        let candidates = self
            .storage
            .search_capabilities(
                &embedding,
                self.config.max_candidates,
                self.config.min_similarity,
            )
            .await
            .map_err(|e| DiscoveryError::Backend(e.to_string()))?;

        let now = Utc::now();
        let mut hits: Vec<DiscoveryHit> = candidates
            .into_iter()
            .filter_map(|candidate| self.score_candidate(candidate, query, now))
            .collect();

        hits.sort_by(|a, b| {
            if (a.combined_score - b.combined_score).abs() > SCORE_EPSILON {
                b.combined_score
                    .partial_cmp(&a.combined_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            } else {
                // Tie: most recently updated trust first.
                b.trust_updated_at.cmp(&a.trust_updated_at)
            }
        });

        if let Ok(encoded) = serde_json::to_string(&hits) {
            if let Err(e) = self
                .cache
                .set(&cache_key, &encoded, self.config.result_cache_ttl)
                .await
            {
                tracing::warn!(error = %e, "discovery cache write failed");
            }
        }
        Ok(hits)
    }

    fn score_candidate(
        &self,
        candidate: CapabilitySearchHit,
        query: &DiscoveryQuery,
        now: DateTime<Utc>,
    ) -> Option<DiscoveryHit> {
        let trust_score = candidate
            .trust
            .as_ref()
            .map(|t| t.decayed_score(now))
            .unwrap_or(0.0);

        if let Some(min_trust) = query.min_trust {
            if trust_score < min_trust {
                return None;
            }
        }
        if !query.tags.is_empty()
            && !candidate
                .capability
                .tags
                .iter()
                .any(|tag| query.tags.contains(tag))
        {
            return None;
        }

        let usefulness = candidate.usefulness_cached;
        let combined_score = if self.config.combined_ranking_enabled {
            candidate.similarity * self.config.weights.similarity
                + trust_score * self.config.weights.trust
                + (usefulness / 100.0) * self.config.weights.usefulness
        } else {
            candidate.similarity
        };

        Some(DiscoveryHit {
            agent_did: candidate.capability.agent_did,
            description: candidate.capability.description,
            tags: candidate.capability.tags,
            version: candidate.capability.version,
            similarity: candidate.similarity,
            trust_score,
            usefulness_score: usefulness,
            combined_score,
            trust_updated_at: candidate.trust.map(|t| t.updated_at),
        })
    }

    fn cache_key(&self, query: &DiscoveryQuery) -> String {
        let mut tags = query.tags.clone();
        tags.sort();
        let normalized = format!(
            "{}|{}|{:?}|{:?}|{:?}",
            query.description.trim().to_lowercase(),
            tags.join(","),
            query.min_trust,
            query.max_latency_ms,
            query.max_cost,
        );
        format!("disc:{}", sha256_hex(normalized.as_bytes()))
    }
}

const SCORE_EPSILON: f64 = 1e-9;

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid discovery query: {0}")]
    InvalidQuery(String),

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("discovery backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_cache::InMemoryCache;
    use ainp_embedding::EmbeddingResult;
    use ainp_storage::memory::InMemoryBrokerStorage;
    use ainp_storage::{AgentRecord, CapabilityRecord, TrustRecord};
    use ainp_types::TrustVector;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct FixedEmbedder {
        vector: Vec<f32>,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> EmbeddingResult<Vec<f32>> {
            Ok(self.vector.clone())
        }

        async fn embed_batch(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
            Ok(vec![self.vector.clone(); texts.len()])
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> EmbeddingResult<Vec<f32>> {
            Err(EmbeddingError::Upstream("connection refused".to_string()))
        }

        async fn embed_batch(&self, _texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
            Err(EmbeddingError::Upstream("connection refused".to_string()))
        }
    }

    fn did(s: &str) -> Did {
        Did::parse(s).unwrap()
    }

    fn trust_all(value: f64) -> TrustVector {
        TrustVector {
            reliability: value,
            honesty: value,
            competence: value,
            timeliness: value,
        }
    }

    /// Register an agent with one capability whose cosine similarity to the
    /// unit query vector is exactly `similarity`.
    async fn seed_agent(
        storage: &InMemoryBrokerStorage,
        did_str: &str,
        similarity: f32,
        trust: f64,
        trust_updated_at: DateTime<Utc>,
        usefulness: f64,
        tags: Vec<String>,
    ) {
        let agent_did = did(did_str);
        let now = Utc::now();
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
            .set_cached_usefulness(&agent_did, usefulness, now)
            .await
            .unwrap();
        storage
            .upsert_trust(TrustRecord {
                agent_did: agent_did.clone(),
                vector: trust_all(trust),
                decay_rate: 1.0,
                updated_at: trust_updated_at,
            })
            .await
            .unwrap();

        // Unit vector at angle acos(similarity) from the x axis.
        let orthogonal = (1.0 - similarity * similarity).sqrt();
        storage
            .replace_capabilities(
                &agent_did,
                vec![CapabilityRecord {
                    id: Uuid::new_v4(),
                    agent_did: agent_did.clone(),
                    description: format!("{did_str} capability"),
                    embedding: vec![similarity, orthogonal, 0.0],
                    tags,
                    version: "1.0.0".to_string(),
                    credential_ref: None,
                    updated_at: now,
                }],
            )
            .await
            .unwrap();
    }

    fn engine(
        storage: Arc<InMemoryBrokerStorage>,
        cache: Arc<InMemoryCache>,
        combined: bool,
    ) -> DiscoveryEngine {
        DiscoveryEngine::new(
            Arc::new(FixedEmbedder {
                vector: vec![1.0, 0.0, 0.0],
            }),
            storage,
            cache,
            DiscoveryConfig {
                combined_ranking_enabled: combined,
                min_similarity: 0.5,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn combined_ranking_orders_by_weighted_score() {
        let storage = Arc::new(InMemoryBrokerStorage::new());
        let base = Utc::now();
        // A: sim 0.9, trust 0.5, usefulness 20 → 0.71
        // B: sim 0.7, trust 0.9, usefulness 80 → 0.77 (trust updated latest)
        // C: sim 0.8, trust 0.8, usefulness 50 → 0.77
        seed_agent(&storage, "did:key:aa", 0.9, 0.5, base - chrono::Duration::hours(3), 20.0, vec![]).await;
        seed_agent(&storage, "did:key:bb", 0.7, 0.9, base, 80.0, vec![]).await;
        seed_agent(&storage, "did:key:cc", 0.8, 0.8, base - chrono::Duration::hours(1), 50.0, vec![]).await;

        let engine = engine(storage, Arc::new(InMemoryCache::new()), true);
        let hits = engine
            .search(&DiscoveryQuery {
                description: "rank these agents".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let order: Vec<&str> = hits.iter().map(|h| h.agent_did.as_str()).collect();
        assert_eq!(order, vec!["did:key:bb", "did:key:cc", "did:key:aa"]);
        assert!((hits[2].combined_score - 0.71).abs() < 1e-6);
        assert!((hits[0].combined_score - 0.77).abs() < 1e-6);
    }

    #[tokio::test]
    async fn disabled_combined_ranking_uses_similarity_only() {
        let storage = Arc::new(InMemoryBrokerStorage::new());
        let base = Utc::now();
        seed_agent(&storage, "did:key:aa", 0.9, 0.1, base, 0.0, vec![]).await;
        seed_agent(&storage, "did:key:bb", 0.7, 1.0, base, 100.0, vec![]).await;

        let engine = engine(storage, Arc::new(InMemoryCache::new()), false);
        let hits = engine
            .search(&DiscoveryQuery {
                description: "similarity only".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits[0].agent_did.as_str(), "did:key:aa");
    }

    #[tokio::test]
    async fn min_trust_and_tags_post_filter() {
        let storage = Arc::new(InMemoryBrokerStorage::new());
        let base = Utc::now();
        seed_agent(&storage, "did:key:aa", 0.9, 0.2, base, 0.0, vec!["nlp".to_string()]).await;
        seed_agent(&storage, "did:key:bb", 0.9, 0.9, base, 0.0, vec!["vision".to_string()]).await;

        let engine = engine(storage, Arc::new(InMemoryCache::new()), true);

        let trusted = engine
            .search(&DiscoveryQuery {
                description: "filter by trust".to_string(),
                min_trust: Some(0.5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted[0].agent_did.as_str(), "did:key:bb");

        let tagged = engine
            .search(&DiscoveryQuery {
                description: "filter by tag".to_string(),
                tags: vec!["nlp".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].agent_did.as_str(), "did:key:aa");
    }

    #[tokio::test]
    async fn results_are_cached_under_the_normalized_query() {
        let storage = Arc::new(InMemoryBrokerStorage::new());
        let cache = Arc::new(InMemoryCache::new());
        let base = Utc::now();
        seed_agent(&storage, "did:key:aa", 0.9, 0.5, base, 0.0, vec![]).await;

        let engine = engine(storage.clone(), cache, true);
        let query = DiscoveryQuery {
            description: "  Cache This  ".to_string(),
            ..Default::default()
        };
        let first = engine.search(&query).await.unwrap();
        assert_eq!(first.len(), 1);

        // New capability appears, but the cached page is still served.
        seed_agent(&storage, "did:key:bb", 0.95, 0.9, base, 0.0, vec![]).await;
        let second = engine
            .search(&DiscoveryQuery {
                description: "cache this".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn empty_description_is_invalid() {
        let engine = engine(
            Arc::new(InMemoryBrokerStorage::new()),
            Arc::new(InMemoryCache::new()),
            true,
        );
        assert!(matches!(
            engine
                .search(&DiscoveryQuery {
                    description: "  ".to_string(),
                    ..Default::default()
                })
                .await,
            Err(DiscoveryError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn embedding_outage_fails_discovery() {
        let engine = DiscoveryEngine::new(
            Arc::new(FailingEmbedder),
            Arc::new(InMemoryBrokerStorage::new()),
            Arc::new(InMemoryCache::new()),
            DiscoveryConfig::default(),
        );
        assert!(matches!(
            engine
                .search(&DiscoveryQuery {
                    description: "anything".to_string(),
                    ..Default::default()
                })
                .await,
            Err(DiscoveryError::EmbeddingUnavailable(_))
        ));
    }
}
