//! Cryptographic identity for the AINP broker.
//!
//! Envelopes are signed with Ed25519 over a canonical byte form: stable key
//! ordering, compact separators, signature field removed. `did:key` DIDs
//! carry their public key; `did:web` DIDs resolve through the agent
//! registry behind the [`KeyResolver`] seam.

#![deny(unsafe_code)]

mod canonical;
mod hash;
mod keys;
mod validator;

pub use canonical::canonical_envelope_bytes;
pub use hash::{blake3_hex, sha256_hex};
pub use keys::{public_key_from_did, AgentKeypair, KeyError};
pub use validator::{EnvelopeValidator, KeyResolver, ValidatedEnvelope, ValidationError};
