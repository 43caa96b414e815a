//! Health and readiness.

use crate::api::rest::state::AppState;
use ainp_cache::BrokerCache;
use ainp_storage::Probe;
use ainp_stream::IntentStream;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
}

/// `GET /health` — liveness.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
    })
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: String,
    pub cache: String,
    pub stream: String,
}

/// `GET /health/ready` — readiness: database, cache, and stream must all
/// answer. Any failure is a 503.
pub async fn readiness(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let database = probe(state.storage.ping().await.map_err(|e| e.to_string()));
    let cache = probe(state.cache.ping().await.map_err(|e| e.to_string()));
    let stream = probe(state.stream.ping().await.map_err(|e| e.to_string()));

    let all_ok = [&database, &cache, &stream].iter().all(|s| *s == "ok");
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if all_ok { "ready" } else { "not_ready" }.to_string(),
            database,
            cache,
            stream,
        }),
    )
}

fn probe(result: Result<(), String>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed");
            format!("error: {e}")
        }
    }
}
