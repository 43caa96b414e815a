//! Registry-backed key resolution for `did:web` identities.

use ainp_crypto::{KeyResolver, ValidationError};
use ainp_storage::AgentStore;
use ainp_types::Did;
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use std::sync::Arc;

/// Resolves DIDs to verification keys via the agent registry.
pub struct StorageKeyResolver {
    storage: Arc<dyn AgentStore>,
}

impl StorageKeyResolver {
    pub fn new(storage: Arc<dyn AgentStore>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl KeyResolver for StorageKeyResolver {
    async fn resolve(&self, did: &Did) -> Result<Option<VerifyingKey>, ValidationError> {
        let agent = self
            .storage
            .get_agent(did)
            .await
            .map_err(|e| ValidationError::ResolverUnavailable(e.to_string()))?;

        let Some(agent) = agent else {
            return Ok(None);
        };
        let Some(key_hex) = agent.public_key_hex else {
            return Ok(None);
        };

        let bytes = hex::decode(&key_hex)
            .map_err(|_| ValidationError::InvalidStructure("malformed registered key".to_string()))?;
        let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            ValidationError::InvalidStructure("registered key has wrong length".to_string())
        })?;
        let key = VerifyingKey::from_bytes(&arr).map_err(|_| {
            ValidationError::InvalidStructure("registered key is not a valid Ed25519 key".to_string())
        })?;
        Ok(Some(key))
    }
}
