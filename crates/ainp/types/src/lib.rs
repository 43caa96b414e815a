//! Core wire and domain types shared across AINP broker crates.
//!
//! Everything that crosses a crate boundary lives here: decentralized
//! identifiers, signed envelopes, the tagged payload value model, negotiation
//! proposals, trust vectors, usefulness proofs, and task receipts.

#![deny(unsafe_code)]

mod did;
mod envelope;
mod negotiation;
mod notification;
mod reputation;
mod trust;
mod usefulness;
mod value;

pub use did::{Did, DidError, DidMethod};
pub use envelope::{Envelope, EnvelopeId, MsgType};
pub use negotiation::{
    IncentiveSplit, NegotiationState, Proposal, Round, SplitError, ATOMIC_CREDITS_PER_TOKEN,
};
pub use notification::Notification;
pub use reputation::{
    Attestation, AttestationType, ReceiptStatus, ReputationDimensions, TaskReceipt,
};
pub use trust::{TrustVector, TRUST_DECAY_RATE_DEFAULT};
pub use usefulness::{ProofError, UsefulnessProof, WorkType};
pub use value::TaggedValue;

/// Dimension of capability and query embeddings.
pub const EMBEDDING_DIM: usize = 1536;
