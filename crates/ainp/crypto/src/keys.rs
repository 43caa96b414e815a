use crate::canonical::canonical_envelope_bytes;
use ainp_types::{Did, DidMethod, Envelope};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

/// An agent's Ed25519 keypair with its derived `did:key` identity.
///
/// The method-specific part of the DID is the hex-encoded public key, so
/// `did:key` identities verify without any registry lookup.
pub struct AgentKeypair {
    signing_key: SigningKey,
}

impl AgentKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a keypair from a 32-byte secret seed, hex encoded.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, KeyError> {
        let bytes = Zeroizing::new(
            hex::decode(secret_hex).map_err(|_| KeyError::InvalidSecret)?,
        );
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecret)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// The `did:key` identity for this keypair.
    pub fn did(&self) -> Did {
        let encoded = hex::encode(self.signing_key.verifying_key().as_bytes());
        Did::parse(&format!("did:key:{encoded}")).expect("hex pubkey is a valid DID")
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign raw bytes, returning the hex-encoded signature.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Sign an envelope in place: canonicalize without the signature field,
    /// then store the hex signature.
    pub fn sign_envelope(&self, envelope: &mut Envelope) -> Result<(), KeyError> {
        let bytes = canonical_envelope_bytes(envelope)
            .map_err(|e| KeyError::Canonicalization(e.to_string()))?;
        envelope.signature = self.sign(&bytes);
        Ok(())
    }
}

/// Extract the Ed25519 public key embedded in a `did:key` DID.
pub fn public_key_from_did(did: &Did) -> Result<VerifyingKey, KeyError> {
    if did.method() != DidMethod::Key {
        return Err(KeyError::NotSelfCertifying(did.clone()));
    }
    let bytes = hex::decode(did.method_specific()).map_err(|_| KeyError::BadKeyEncoding)?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| KeyError::BadKeyEncoding)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::BadKeyEncoding)
}

/// Verify a hex signature over raw bytes.
pub fn verify_signature(
    key: &VerifyingKey,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), KeyError> {
    let sig_bytes = hex::decode(signature_hex).map_err(|_| KeyError::BadSignatureEncoding)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| KeyError::BadSignatureEncoding)?;
    key.verify(message, &signature)
        .map_err(|_| KeyError::SignatureMismatch)
}

/// Key handling errors.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret seed")]
    InvalidSecret,

    #[error("DID does not embed a public key: {0}")]
    NotSelfCertifying(Did),

    #[error("malformed public key encoding")]
    BadKeyEncoding,

    #[error("malformed signature encoding")]
    BadSignatureEncoding,

    #[error("signature does not verify")]
    SignatureMismatch,

    #[error("canonicalization failed: {0}")]
    Canonicalization(String),
}
