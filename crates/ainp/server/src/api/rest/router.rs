//! API router configuration.

use super::handlers;
use super::state::AppState;
use crate::api::ws;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router.
pub fn create_router(state: AppState, enable_cors: bool) -> Router {
    let api_routes = Router::new()
        // Agents
        .route("/agents/register", post(handlers::register_agent))
        .route("/agents/:did", get(handlers::get_agent))
        // Discovery
        .route("/discovery/search", post(handlers::search))
        // Intents
        .route("/intents/send", post(handlers::send_intent))
        .route("/intents/postage", post(handlers::pay_postage))
        // Contacts
        .route("/contacts/allow", post(handlers::allow_contact))
        .route("/contacts/block", post(handlers::block_contact))
        .route("/contacts/:peer", get(handlers::get_contact))
        // Negotiations
        .route("/negotiations", post(handlers::initiate_negotiation))
        .route("/negotiations", get(handlers::list_negotiations))
        .route("/negotiations/:id", get(handlers::get_negotiation))
        .route(
            "/negotiations/:id/propose",
            post(handlers::propose_negotiation),
        )
        .route(
            "/negotiations/:id/accept",
            post(handlers::accept_negotiation),
        )
        .route(
            "/negotiations/:id/reject",
            post(handlers::reject_negotiation),
        )
        .route(
            "/negotiations/:id/settle",
            post(handlers::settle_negotiation),
        )
        // Mail
        .route("/mail/inbox", get(handlers::list_inbox))
        .route("/mail/threads/:conversation_id", get(handlers::get_thread))
        .route("/mail/read", post(handlers::mark_read))
        .route("/mail/label", post(handlers::label_message))
        // Usefulness and receipts
        .route("/usefulness/proofs", post(handlers::submit_proof))
        .route("/usefulness/agents/:did", get(handlers::get_usefulness))
        .route("/receipts/:id", get(handlers::get_receipt))
        .route(
            "/receipts/:id/attestations",
            post(handlers::submit_attestation),
        )
        // Ledger
        .route("/ledger/accounts/:did", get(handlers::get_account))
        .route(
            "/ledger/accounts/:did/entries",
            get(handlers::list_ledger_entries),
        )
        // Payments
        .route("/payments/requests", post(handlers::create_payment_request))
        .route(
            "/payments/webhooks/:provider",
            post(handlers::payment_webhook),
        );

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/ready", get(handlers::readiness))
        .route("/ws", get(ws::session_handler))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}
