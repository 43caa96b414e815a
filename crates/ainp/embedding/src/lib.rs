//! Embedding adapter: text to 1536-dim cosine-normalized vectors.
//!
//! Vectors come from a remote OpenAI-shaped embedding API and are cached by
//! SHA-256 of the input text. When the upstream is unavailable the adapter
//! fails the request; discovery must be correct or absent, never built on
//! fabricated vectors.

#![deny(unsafe_code)]

use ainp_cache::BrokerCache;
use ainp_crypto::sha256_hex;
use ainp_types::EMBEDDING_DIM;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

const DEFAULT_EMBEDDING_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-process cap on in-flight upstream requests.
const DEFAULT_CONCURRENCY: usize = 32;

/// Result type for embedding operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Text-to-vector seam used by discovery and capability registration.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>>;
}

/// Configuration for the HTTP embedding client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_EMBEDDING_ENDPOINT.to_string(),
            api_key: String::new(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            max_concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// HTTP embedding client with a content-addressed cache in front.
pub struct HttpEmbeddingClient {
    client: Client,
    config: EmbeddingConfig,
    cache: Arc<dyn BrokerCache>,
    permits: Semaphore,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingConfig, cache: Arc<dyn BrokerCache>) -> EmbeddingResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|e| EmbeddingError::Upstream(e.to_string()))?;
        let max_concurrency = config.max_concurrency.max(1);
        Ok(Self {
            client,
            config,
            cache,
            permits: Semaphore::new(max_concurrency),
        })
    }

    async fn fetch_remote(&self, inputs: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EmbeddingError::Upstream("embedding semaphore closed".to_string()))?;

        let request = EmbeddingRequest {
            model: &self.config.model,
            input: inputs,
        };
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbeddingError::Upstream(format!(
                "embedding API returned {}",
                response.status()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Upstream(e.to_string()))?;

        if parsed.data.len() != inputs.len() {
            return Err(EmbeddingError::Upstream(format!(
                "embedding API returned {} vectors for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for data in parsed.data {
            if data.embedding.len() != EMBEDDING_DIM {
                return Err(EmbeddingError::WrongDimension(data.embedding.len()));
            }
            vectors.push(data.embedding);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let text_hash = sha256_hex(text.as_bytes());
        if let Ok(Some(cached)) = self.cache.lookup_embedding(&text_hash).await {
            return Ok(cached);
        }

        let vectors = self.fetch_remote(std::slice::from_ref(&text.to_string())).await?;
        let vector = vectors.into_iter().next().ok_or_else(|| {
            EmbeddingError::Upstream("embedding API returned no vectors".to_string())
        })?;

        if let Err(e) = self.cache.cache_embedding(&text_hash, &vector).await {
            tracing::warn!(error = %e, "embedding cache write failed");
        }
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::EmptyInput);
        }

        // Serve cache hits and only fetch the misses.
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses = Vec::new();
        for (index, text) in texts.iter().enumerate() {
            let text_hash = sha256_hex(text.as_bytes());
            match self.cache.lookup_embedding(&text_hash).await {
                Ok(Some(cached)) => results[index] = Some(cached),
                _ => misses.push(index),
            }
        }

        if !misses.is_empty() {
            let inputs: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let fetched = self.fetch_remote(&inputs).await?;
            for (&index, vector) in misses.iter().zip(fetched) {
                let text_hash = sha256_hex(texts[index].as_bytes());
                if let Err(e) = self.cache.cache_embedding(&text_hash, &vector).await {
                    tracing::warn!(error = %e, "embedding cache write failed");
                }
                results[index] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}

/// Embedding adapter errors.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding input is empty")]
    EmptyInput,

    #[error("embedding upstream unavailable: {0}")]
    Upstream(String),

    #[error("embedding has wrong dimension: {0}")]
    WrongDimension(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_cache::InMemoryCache;

    #[tokio::test]
    async fn empty_input_is_rejected_before_any_network() {
        let cache = Arc::new(InMemoryCache::new());
        let client = HttpEmbeddingClient::new(EmbeddingConfig::default(), cache).unwrap();
        assert!(matches!(
            client.embed("   ").await,
            Err(EmbeddingError::EmptyInput)
        ));
    }

    #[tokio::test]
    async fn cached_vector_short_circuits_the_upstream() {
        let cache = Arc::new(InMemoryCache::new());
        let text = "summarize quarterly filings";
        let vector = vec![0.5f32; EMBEDDING_DIM];
        cache
            .cache_embedding(&sha256_hex(text.as_bytes()), &vector)
            .await
            .unwrap();

        // Endpoint is unroutable: a cache miss would fail loudly.
        let config = EmbeddingConfig {
            endpoint: "http://127.0.0.1:1/v1/embeddings".to_string(),
            ..Default::default()
        };
        let client = HttpEmbeddingClient::new(config, cache).unwrap();
        assert_eq!(client.embed(text).await.unwrap(), vector);
    }

    #[tokio::test]
    async fn unavailable_upstream_fails_the_request() {
        let cache = Arc::new(InMemoryCache::new());
        let config = EmbeddingConfig {
            endpoint: "http://127.0.0.1:1/v1/embeddings".to_string(),
            ..Default::default()
        };
        let client = HttpEmbeddingClient::new(config, cache).unwrap();
        assert!(matches!(
            client.embed("anything").await,
            Err(EmbeddingError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn batch_serves_hits_from_cache() {
        let cache = Arc::new(InMemoryCache::new());
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        for text in &texts {
            cache
                .cache_embedding(&sha256_hex(text.as_bytes()), &vec![0.1f32; EMBEDDING_DIM])
                .await
                .unwrap();
        }

        let config = EmbeddingConfig {
            endpoint: "http://127.0.0.1:1/v1/embeddings".to_string(),
            ..Default::default()
        };
        let client = HttpEmbeddingClient::new(config, cache).unwrap();
        let vectors = client.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
    }
}
