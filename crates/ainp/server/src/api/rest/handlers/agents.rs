//! Agent registration and lookup.

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use ainp_embedding::Embedder;
use ainp_storage::{AgentRecord, AgentStore, CapabilityRecord, TrustRecord};
use ainp_types::{Did, TrustVector, TRUST_DECAY_RATE_DEFAULT};
use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEFAULT_AGENT_TTL_SECONDS: u64 = 3600;
const DEFAULT_CAPABILITY_VERSION: &str = "1.0.0";

/// One declared capability on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDecl {
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub credential_ref: Option<String>,
}

/// An agent's full address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAddress {
    pub did: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDecl>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub address: AgentAddress,
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub status: String,
    pub did: Did,
}

/// `POST /api/agents/register` — idempotent; capabilities are replaced to
/// match the latest address and each description is embedded.
pub async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<RegisterResponse>> {
    let did = Did::parse(&request.address.did)
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let now = Utc::now();

    state
        .storage
        .upsert_agent(AgentRecord {
            did: did.clone(),
            endpoint: request.address.endpoint.clone(),
            public_key_hex: request.address.public_key.clone(),
            ttl_seconds: request.ttl.unwrap_or(DEFAULT_AGENT_TTL_SECONDS),
            usefulness_cached: 0.0,
            usefulness_updated_at: None,
            registered_at: now,
            last_seen: now,
        })
        .await?;

    let descriptions: Vec<String> = request
        .address
        .capabilities
        .iter()
        .map(|c| c.description.clone())
        .collect();
    let embeddings = if descriptions.is_empty() {
        Vec::new()
    } else {
        state
            .embedder
            .embed_batch(&descriptions)
            .await
            .map_err(|e| ApiError::DependencyUnavailable(e.to_string()))?
    };

    let capabilities: Vec<CapabilityRecord> = request
        .address
        .capabilities
        .iter()
        .zip(embeddings)
        .map(|(decl, embedding)| CapabilityRecord {
            id: Uuid::new_v4(),
            agent_did: did.clone(),
            description: decl.description.clone(),
            embedding,
            tags: decl.tags.clone(),
            version: decl
                .version
                .clone()
                .unwrap_or_else(|| DEFAULT_CAPABILITY_VERSION.to_string()),
            credential_ref: decl.credential_ref.clone(),
            updated_at: now,
        })
        .collect();
    state.storage.replace_capabilities(&did, capabilities).await?;

    // First registration seeds a neutral trust record and an empty account.
    if state.storage.get_trust(&did).await?.is_none() {
        state
            .storage
            .upsert_trust(TrustRecord {
                agent_did: did.clone(),
                vector: TrustVector::default(),
                decay_rate: TRUST_DECAY_RATE_DEFAULT,
                updated_at: now,
            })
            .await?;
    }
    state.ledger.create_account(&did, 0).await?;

    tracing::info!(%did, "agent registered");
    Ok(Json(RegisterResponse {
        status: "registered".to_string(),
        did,
    }))
}

#[derive(Debug, Serialize)]
pub struct AgentResponse {
    pub did: Did,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub capabilities: Vec<CapabilityDecl>,
    pub usefulness_score: f64,
    pub registered_at: chrono::DateTime<Utc>,
    pub last_seen: chrono::DateTime<Utc>,
}

/// `GET /api/agents/{did}` — the full address.
pub async fn get_agent(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> ApiResult<Json<AgentResponse>> {
    let did = Did::parse(&did).map_err(|e| ApiError::Validation(e.to_string()))?;
    let agent = state
        .storage
        .get_agent(&did)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("agent {did}")))?;
    let capabilities = state.storage.list_capabilities(&did).await?;

    Ok(Json(AgentResponse {
        did: agent.did,
        endpoint: agent.endpoint,
        public_key: agent.public_key_hex,
        capabilities: capabilities
            .into_iter()
            .map(|c| CapabilityDecl {
                description: c.description,
                tags: c.tags,
                version: Some(c.version),
                credential_ref: c.credential_ref,
            })
            .collect(),
        usefulness_score: agent.usefulness_cached,
        registered_at: agent.registered_at,
        last_seen: agent.last_seen,
    }))
}
