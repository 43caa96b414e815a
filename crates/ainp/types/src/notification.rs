use crate::{Did, NegotiationState, Proposal};
use serde::{Deserialize, Serialize};

/// Real-time notifications pushed to connected sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    NewMessage {
        message_id: String,
        conversation_id: String,
        from_did: Did,
    },
    NegotiationEvent {
        event: String,
        negotiation_id: String,
        state: NegotiationState,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_proposal: Option<Proposal>,
        round_number: u32,
        convergence_score: f64,
    },
}
