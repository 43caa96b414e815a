//! Usefulness proofs, task receipts, and ledger reads.

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use ainp_storage::{AccountRecord, LedgerEntryRecord, QueryWindow};
use ainp_types::{Attestation, Did, TaskReceipt, UsefulnessProof, WorkType};
use ainp_usefulness::{ProofSubmission, UsefulnessReport};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct ProofBody {
    pub intent_id: String,
    pub work_type: WorkType,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub attestations: Vec<String>,
    pub trace_id: String,
    pub usefulness_score: f64,
}

/// `POST /api/usefulness/proofs`
pub async fn submit_proof(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProofBody>,
) -> ApiResult<Json<UsefulnessProof>> {
    if !state.features.usefulness_aggregation_enabled {
        return Err(ApiError::FeatureDisabled("usefulness_aggregation"));
    }
    let caller = state.caller(&headers)?;

    let proof = state
        .usefulness
        .submit_proof(ProofSubmission {
            intent_id: body.intent_id,
            agent_did: caller,
            work_type: body.work_type,
            metrics: body.metrics,
            attestations: body.attestations,
            trace_id: body.trace_id,
            usefulness_score: body.usefulness_score,
        })
        .await?;
    Ok(Json(proof))
}

#[derive(Debug, Serialize)]
pub struct UsefulnessResponse {
    pub agent_did: Did,
    pub overall: f64,
    pub by_work_type: BTreeMap<String, f64>,
    pub proof_count: usize,
}

impl From<UsefulnessReport> for UsefulnessResponse {
    fn from(report: UsefulnessReport) -> Self {
        Self {
            agent_did: report.agent_did,
            overall: report.overall,
            by_work_type: report.by_work_type,
            proof_count: report.proof_count,
        }
    }
}

/// `GET /api/usefulness/agents/{did}`
pub async fn get_usefulness(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> ApiResult<Json<UsefulnessResponse>> {
    if !state.features.usefulness_aggregation_enabled {
        return Err(ApiError::FeatureDisabled("usefulness_aggregation"));
    }
    let did = Did::parse(&did).map_err(|e| ApiError::Validation(e.to_string()))?;
    let report = state.usefulness.score(&did).await?;
    Ok(Json(report.into()))
}

/// `GET /api/receipts/{id}`
pub async fn get_receipt(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskReceipt>> {
    Ok(Json(state.receipts.get_receipt(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AttestationBody {
    pub attestation_type: ainp_types::AttestationType,
    pub score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub evidence_ref: Option<String>,
    pub signature: String,
}

#[derive(Debug, Serialize)]
pub struct AttestationResponse {
    pub receipt: TaskReceipt,
    pub finalized: bool,
}

/// `POST /api/receipts/{id}/attestations` — committee members and the
/// client attest here; finalization happens inline when the rule is met.
pub async fn submit_attestation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<AttestationBody>,
) -> ApiResult<Json<AttestationResponse>> {
    let caller = state.caller(&headers)?;
    let outcome = state
        .receipts
        .submit_attestation(
            &id,
            Attestation {
                by_did: caller,
                attestation_type: body.attestation_type,
                score: body.score,
                confidence: body.confidence,
                evidence_ref: body.evidence_ref,
                signature: body.signature,
            },
        )
        .await?;
    Ok(Json(AttestationResponse {
        receipt: outcome.receipt,
        finalized: outcome.finalized,
    }))
}

/// `GET /api/ledger/accounts/{did}`
pub async fn get_account(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> ApiResult<Json<AccountRecord>> {
    if !state.features.credit_ledger_enabled {
        return Err(ApiError::FeatureDisabled("credit_ledger"));
    }
    let did = Did::parse(&did).map_err(|e| ApiError::Validation(e.to_string()))?;
    Ok(Json(state.ledger.get_account(&did).await?))
}

#[derive(Debug, Deserialize)]
pub struct EntriesParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// `GET /api/ledger/accounts/{did}/entries`
pub async fn list_ledger_entries(
    State(state): State<AppState>,
    Path(did): Path<String>,
    Query(params): Query<EntriesParams>,
) -> ApiResult<Json<Vec<LedgerEntryRecord>>> {
    if !state.features.credit_ledger_enabled {
        return Err(ApiError::FeatureDisabled("credit_ledger"));
    }
    let did = Did::parse(&did).map_err(|e| ApiError::Validation(e.to_string()))?;
    let entries = state
        .ledger
        .list_entries(
            &did,
            QueryWindow {
                limit: params.limit.unwrap_or(100),
                offset: params.offset.unwrap_or(0),
            },
        )
        .await?;
    Ok(Json(entries))
}
