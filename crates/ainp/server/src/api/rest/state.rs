//! Application state for API handlers.

use crate::config::FeatureFlags;
use crate::error::{ApiError, ApiResult};
use ainp_cache::BrokerCache;
use ainp_delivery::{ConsumerBridge, SessionRegistry};
use ainp_discovery::DiscoveryEngine;
use ainp_embedding::Embedder;
use ainp_guard::FraudGuard;
use ainp_ledger::CreditLedger;
use ainp_mailbox::{ContactService, MailboxService};
use ainp_negotiation::NegotiationService;
use ainp_reputation::ReceiptService;
use ainp_router::IntentRouter;
use ainp_storage::BrokerStorage;
use ainp_stream::IntentStream;
use ainp_types::Did;
use ainp_usefulness::UsefulnessAggregator;
use axum::http::HeaderMap;
use std::sync::Arc;

/// Identity assertion header.
pub const DID_HEADER: &str = "x-ainp-did";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn BrokerStorage>,
    pub cache: Arc<dyn BrokerCache>,
    pub stream: Arc<dyn IntentStream>,
    pub embedder: Arc<dyn Embedder>,
    pub router: Arc<IntentRouter>,
    pub discovery: Arc<DiscoveryEngine>,
    pub mailbox: Arc<MailboxService>,
    pub contacts: Arc<ContactService>,
    pub ledger: Arc<CreditLedger>,
    pub guard: Arc<FraudGuard>,
    pub negotiations: Arc<NegotiationService>,
    pub usefulness: Arc<UsefulnessAggregator>,
    pub receipts: Arc<ReceiptService>,
    pub sessions: Arc<SessionRegistry>,
    pub bridge: Arc<ConsumerBridge>,
    pub features: FeatureFlags,
    pub version: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// The authenticated caller from the `X-AINP-DID` header.
    pub fn caller(&self, headers: &HeaderMap) -> ApiResult<Did> {
        let raw = headers
            .get(DID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError::Authentication("missing X-AINP-DID header".to_string())
            })?;
        Did::parse(raw).map_err(|e| ApiError::Authentication(e.to_string()))
    }

    /// Uptime as a human-readable string.
    pub fn uptime(&self) -> String {
        let duration = chrono::Utc::now() - self.started_at;
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs < 86400 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else {
            format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
        }
    }
}
