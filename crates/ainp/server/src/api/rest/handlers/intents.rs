//! The intent send path.

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use ainp_discovery::DiscoveryQuery;
use ainp_router::SendRequest;
use ainp_types::Envelope;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Stamped when the rate limiter failed open on a cache outage.
const DEGRADED_HEADER: &str = "x-ainp-degraded";

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub status: String,
    pub agent_count: usize,
}

#[derive(Debug, serde::Deserialize)]
pub struct PostageRequest {
    pub to_did: ainp_types::Did,
    pub envelope_id: String,
}

#[derive(Debug, Serialize)]
pub struct PostageResponse {
    pub status: String,
    pub charged: i64,
}

/// `POST /api/intents/postage` — pre-spend postage for a greylisted
/// envelope; the minted bypass token lives for the replay window, so the
/// resend must carry the same envelope id.
pub async fn pay_postage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PostageRequest>,
) -> ApiResult<Json<PostageResponse>> {
    if !state.features.messaging_enabled {
        return Err(ApiError::FeatureDisabled("messaging"));
    }
    if !state.features.greylist_bypass_payment_enabled {
        return Err(ApiError::FeatureDisabled("greylist_bypass_payment"));
    }
    let caller = state.caller(&headers)?;

    let charged = state
        .guard
        .pay_postage(
            &caller,
            &request.to_did,
            &ainp_types::EnvelopeId(request.envelope_id),
        )
        .await?;
    Ok(Json(PostageResponse {
        status: "postage_accepted".to_string(),
        charged,
    }))
}

/// `POST /api/intents/send` — body is the signed envelope, with an optional
/// sibling `query` object for broadcast recipient selection.
pub async fn send_intent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response> {
    if !state.features.messaging_enabled {
        return Err(ApiError::FeatureDisabled("messaging"));
    }

    let caller = state.caller(&headers)?;

    let query = match body.get("query") {
        Some(raw) => Some(
            serde_json::from_value::<DiscoveryQuery>(raw.clone())
                .map_err(|e| ApiError::Validation(format!("invalid query: {e}")))?,
        ),
        None => None,
    };
    let envelope: Envelope = serde_json::from_value(body)
        .map_err(|e| ApiError::Validation(format!("invalid envelope: {e}")))?;

    let outcome = state
        .router
        .send(SendRequest {
            envelope,
            asserted_did: Some(caller),
            client_ip: None,
            query,
        })
        .await?;

    let mut response = Json(SendResponse {
        status: "routed".to_string(),
        agent_count: outcome.agent_count,
    })
    .into_response();
    if outcome.degraded {
        response.headers_mut().insert(
            HeaderName::from_static(DEGRADED_HEADER),
            HeaderValue::from_static("cache"),
        );
    }
    Ok(response)
}
