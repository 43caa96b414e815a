//! Unified storage abstractions for the AINP broker.
//!
//! This crate defines the persistence contract for every broker subsystem:
//! agents/capabilities/trust, mailboxes and threads, contacts, negotiations,
//! credit accounts with their append-only journal, payment requests,
//! usefulness proofs, and task receipts.
//!
//! Design stance:
//! - Postgres is the transactional source of truth (pgvector for capability
//!   embeddings); the adapter owns idempotent schema init.
//! - The in-memory backend is a deterministic reference implementation with
//!   the same observable semantics, used by tests and development.
//! - Balance-changing and aggregate-changing operations are atomic inside
//!   the backend, so invariants hold under concurrent writers.

#![deny(unsafe_code)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use model::{
    AccountRecord, AgentRecord, CapabilityRecord, CapabilitySearchHit, ConsentState, ContactRecord,
    InboxCursor, InboxQuery, LedgerEntryRecord, LedgerEntryType, MessageRecord,
    NegotiationFilter, NegotiationRecord, PaymentRequestRecord, PaymentState,
    ReputationRecord, StoreOutcome, ThreadRecord, TrustRecord,
};
pub use traits::{
    AccountStore, AgentStore, BrokerStorage, ContactStore, MailboxStore, NegotiationStore,
    PaymentStore, Probe, ProofStore, QueryWindow, ReceiptStore,
};
