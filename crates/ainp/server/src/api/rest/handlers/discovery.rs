//! Semantic discovery search.

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use ainp_discovery::{DiscoveryHit, DiscoveryQuery};
use axum::extract::State;
use axum::Json;

/// `POST /api/discovery/search` — ranked per the combined-ranking
/// procedure; ranking weights come from configuration.
pub async fn search(
    State(state): State<AppState>,
    Json(query): Json<DiscoveryQuery>,
) -> ApiResult<Json<Vec<DiscoveryHit>>> {
    let hits = state.discovery.search(&query).await?;
    Ok(Json(hits))
}
