//! Contact consent management.

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use ainp_storage::ContactRecord;
use ainp_types::Did;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ConsentRequest {
    pub peer_did: Did,
}

/// `POST /api/contacts/allow` — lift the greylist for a sender.
pub async fn allow_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConsentRequest>,
) -> ApiResult<Json<ContactRecord>> {
    let caller = state.caller(&headers)?;
    Ok(Json(state.contacts.allow(&caller, &request.peer_did).await?))
}

/// `POST /api/contacts/block`
pub async fn block_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ConsentRequest>,
) -> ApiResult<Json<ContactRecord>> {
    let caller = state.caller(&headers)?;
    Ok(Json(state.contacts.block(&caller, &request.peer_did).await?))
}

/// `GET /api/contacts/{peer}`
pub async fn get_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(peer): Path<String>,
) -> ApiResult<Json<ContactRecord>> {
    let caller = state.caller(&headers)?;
    let peer = Did::parse(&peer).map_err(|e| ApiError::Validation(e.to_string()))?;
    state
        .contacts
        .get(&caller, &peer)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("contact {peer}")))
}
