use crate::canonical::canonical_envelope_bytes;
use crate::keys::{public_key_from_did, verify_signature, KeyError};
use ainp_types::{Did, DidMethod, Envelope};
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use std::sync::Arc;
use thiserror::Error;

/// Resolves a DID to its registered verification key.
///
/// `did:key` DIDs never reach the resolver; `did:web` DIDs require a
/// registry entry.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, did: &Did) -> Result<Option<VerifyingKey>, ValidationError>;
}

/// A successfully validated envelope.
#[derive(Clone, Debug)]
pub struct ValidatedEnvelope {
    pub sender: Did,
    pub canonical_bytes: Vec<u8>,
}

/// Envelope structural + signature validator.
///
/// Fails closed: any mismatch between the asserted identity and the
/// envelope, an expired timestamp, an unknown sender, or a bad signature
/// rejects the envelope before it touches the pipeline.
pub struct EnvelopeValidator {
    resolver: Arc<dyn KeyResolver>,
}

impl EnvelopeValidator {
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self { resolver }
    }

    /// Validate an envelope against an optionally asserted outer identity.
    ///
    /// Returns the sender DID and the canonical bytes the signature covers.
    pub async fn validate(
        &self,
        envelope: &Envelope,
        asserted_did: Option<&Did>,
        now_ms: i64,
    ) -> Result<ValidatedEnvelope, ValidationError> {
        if envelope.id.0.is_empty() || envelope.trace_id.is_empty() {
            return Err(ValidationError::InvalidStructure(
                "envelope id and trace_id are required".to_string(),
            ));
        }
        if envelope.ttl_seconds == 0 {
            return Err(ValidationError::InvalidStructure(
                "ttl_seconds must be positive".to_string(),
            ));
        }

        if let Some(asserted) = asserted_did {
            if asserted != &envelope.from_did {
                return Err(ValidationError::DidMismatch {
                    asserted: asserted.clone(),
                    envelope: envelope.from_did.clone(),
                });
            }
        }

        if envelope.is_expired(now_ms) {
            return Err(ValidationError::Expired);
        }

        let key = match envelope.from_did.method() {
            DidMethod::Key => public_key_from_did(&envelope.from_did)
                .map_err(|e| ValidationError::InvalidStructure(e.to_string()))?,
            DidMethod::Web => self
                .resolver
                .resolve(&envelope.from_did)
                .await?
                .ok_or_else(|| ValidationError::UnknownSender(envelope.from_did.clone()))?,
        };

        let canonical_bytes = canonical_envelope_bytes(envelope)?;
        match verify_signature(&key, &canonical_bytes, &envelope.signature) {
            Ok(()) => Ok(ValidatedEnvelope {
                sender: envelope.from_did.clone(),
                canonical_bytes,
            }),
            Err(KeyError::SignatureMismatch) => Err(ValidationError::SignatureInvalid),
            Err(e) => Err(ValidationError::InvalidStructure(e.to_string())),
        }
    }
}

/// Envelope validation failures.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid envelope structure: {0}")]
    InvalidStructure(String),

    #[error("signature does not verify against sender key")]
    SignatureInvalid,

    #[error("unknown sender: {0}")]
    UnknownSender(Did),

    #[error("envelope expired")]
    Expired,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("asserted DID {asserted} does not match envelope sender {envelope}")]
    DidMismatch { asserted: Did, envelope: Did },

    #[error("key resolution failed: {0}")]
    ResolverUnavailable(String),
}
