//! REST handlers, one module per resource.

mod agents;
mod contacts;
mod discovery;
mod health;
mod intents;
mod mail;
mod negotiations;
mod payments;
mod usefulness;

pub use agents::{get_agent, register_agent};
pub use contacts::{allow_contact, block_contact, get_contact};
pub use discovery::search;
pub use health::{health_check, readiness};
pub use intents::{pay_postage, send_intent};
pub use mail::{get_thread, label_message, list_inbox, mark_read};
pub use negotiations::{
    accept_negotiation, get_negotiation, initiate_negotiation, list_negotiations,
    propose_negotiation, reject_negotiation, settle_negotiation,
};
pub use payments::{create_payment_request, payment_webhook};
pub use usefulness::{
    get_account, get_receipt, get_usefulness, list_ledger_entries, submit_attestation,
    submit_proof,
};
