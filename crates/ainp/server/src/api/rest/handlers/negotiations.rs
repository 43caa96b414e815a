//! Negotiation lifecycle endpoints.
//!
//! Every successful transition pushes a `negotiation_event` notification to
//! both participants' live sessions.

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use ainp_negotiation::InitiateRequest;
use ainp_storage::{NegotiationFilter, NegotiationRecord, QueryWindow};
use ainp_types::{Did, IncentiveSplit, NegotiationState, Notification, Proposal};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

fn require_enabled(state: &AppState) -> ApiResult<()> {
    if !state.features.negotiation_enabled {
        return Err(ApiError::FeatureDisabled("negotiation"));
    }
    Ok(())
}

fn notify_participants(state: &AppState, event: &str, record: &NegotiationRecord) {
    let notification = Notification::NegotiationEvent {
        event: event.to_string(),
        negotiation_id: record.id.clone(),
        state: record.state,
        current_proposal: record.current_proposal.clone(),
        round_number: record.rounds.len() as u32,
        convergence_score: record.convergence_score,
    };
    for participant in [&record.initiator_did, &record.responder_did] {
        state.sessions.push(participant, notification.clone());
    }
}

#[derive(Debug, Deserialize)]
pub struct InitiateBody {
    pub intent_id: String,
    pub responder_did: Did,
    pub proposal: Proposal,
    #[serde(default)]
    pub max_rounds: Option<u32>,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
    #[serde(default)]
    pub incentive_split: Option<IncentiveSplit>,
}

/// `POST /api/negotiations`
pub async fn initiate_negotiation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<InitiateBody>,
) -> ApiResult<Json<NegotiationRecord>> {
    require_enabled(&state)?;
    let caller = state.caller(&headers)?;

    let record = state
        .negotiations
        .initiate(InitiateRequest {
            intent_id: body.intent_id,
            initiator: caller,
            responder: body.responder_did,
            proposal: body.proposal,
            max_rounds: body.max_rounds,
            ttl_minutes: body.ttl_minutes,
            incentive_split: body.incentive_split,
        })
        .await?;
    notify_participants(&state, "initiated", &record);
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct ProposeBody {
    pub proposal: Proposal,
}

/// `POST /api/negotiations/{id}/propose`
pub async fn propose_negotiation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ProposeBody>,
) -> ApiResult<Json<NegotiationRecord>> {
    require_enabled(&state)?;
    let caller = state.caller(&headers)?;
    let record = state.negotiations.propose(&id, &caller, body.proposal).await?;
    notify_participants(&state, "proposed", &record);
    Ok(Json(record))
}

/// `POST /api/negotiations/{id}/accept`
pub async fn accept_negotiation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<NegotiationRecord>> {
    require_enabled(&state)?;
    let caller = state.caller(&headers)?;
    let record = state.negotiations.accept(&id, &caller).await?;
    notify_participants(&state, "accepted", &record);
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /api/negotiations/{id}/reject`
pub async fn reject_negotiation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> ApiResult<Json<NegotiationRecord>> {
    require_enabled(&state)?;
    let caller = state.caller(&headers)?;
    let reason = body.and_then(|Json(b)| b.reason);
    let record = state.negotiations.reject(&id, &caller, reason).await?;
    notify_participants(&state, "rejected", &record);
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
pub struct SettleBody {
    #[serde(default)]
    pub validator_did: Option<Did>,
    #[serde(default)]
    pub usefulness_proof_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SettleResponse {
    pub negotiation: NegotiationRecord,
    pub receipt_id: String,
    pub distributed: DistributionSummary,
}

#[derive(Debug, Serialize)]
pub struct DistributionSummary {
    pub agent: i64,
    pub broker: i64,
    pub validator: i64,
    pub pool: i64,
}

/// `POST /api/negotiations/{id}/settle`
pub async fn settle_negotiation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<SettleBody>>,
) -> ApiResult<Json<SettleResponse>> {
    require_enabled(&state)?;
    let caller = state.caller(&headers)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    // Only a participant settles.
    let record = state.negotiations.get(&id).await?;
    if caller != record.initiator_did && caller != record.responder_did {
        return Err(ApiError::Authorization(format!(
            "{caller} is not a participant in negotiation {id}"
        )));
    }

    let outcome = state
        .negotiations
        .settle(&id, body.validator_did, body.usefulness_proof_id)
        .await?;
    notify_participants(&state, "settled", &outcome.negotiation);
    Ok(Json(SettleResponse {
        negotiation: outcome.negotiation,
        receipt_id: outcome.receipt.id,
        distributed: DistributionSummary {
            agent: outcome.distribution.agent,
            broker: outcome.distribution.broker,
            validator: outcome.distribution.validator,
            pool: outcome.distribution.pool,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub agent_did: Option<Did>,
    #[serde(default)]
    pub state: Option<NegotiationState>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// `GET /api/negotiations`
pub async fn list_negotiations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<NegotiationRecord>>> {
    require_enabled(&state)?;
    let records = state
        .negotiations
        .list(
            NegotiationFilter {
                agent_did: params.agent_did,
                state: params.state,
            },
            QueryWindow {
                limit: params.limit.unwrap_or(50),
                offset: params.offset.unwrap_or(0),
            },
        )
        .await?;
    Ok(Json(records))
}

/// `GET /api/negotiations/{id}`
pub async fn get_negotiation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NegotiationRecord>> {
    require_enabled(&state)?;
    Ok(Json(state.negotiations.get(&id).await?))
}
