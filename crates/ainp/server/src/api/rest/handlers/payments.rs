//! Payment requests and provider webhooks.

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use ainp_storage::{PaymentRequestRecord, PaymentState, PaymentStore};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

const PAYMENT_EXPIRY_MINUTES: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct PaymentRequestBody {
    pub amount_atomic: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_method() -> String {
    "lightning".to_string()
}

/// `POST /api/payments/requests` — 201 with the `AINP-Pay` challenge and a
/// `Link: rel="payment"` header.
pub async fn create_payment_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PaymentRequestBody>,
) -> ApiResult<Response> {
    if !state.features.payments_enabled {
        return Err(ApiError::FeatureDisabled("payments"));
    }
    let caller = state.caller(&headers)?;
    if body.amount_atomic <= 0 {
        return Err(ApiError::Validation(format!(
            "amount must be positive, got {}",
            body.amount_atomic
        )));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let record = PaymentRequestRecord {
        id: id.clone(),
        owner_did: caller,
        amount_atomic: body.amount_atomic,
        currency: body.currency,
        method: body.method.clone(),
        state: PaymentState::Pending,
        payment_url: format!("https://pay.ainp.network/requests/{id}"),
        created_at: now,
        expires_at: now + ChronoDuration::minutes(PAYMENT_EXPIRY_MINUTES),
    };
    state.storage.insert_payment_request(record.clone()).await?;

    let challenge = format!(
        "AINP-Pay realm=\"ainp\", request_id=\"{}\", method=\"{}\"",
        record.id, record.method
    );
    let link = format!("<{}>; rel=\"payment\"", record.payment_url);

    let mut response = (StatusCode::CREATED, Json(record)).into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&link) {
        response.headers_mut().insert(header::LINK, value);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub request_id: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: String,
}

/// `POST /api/payments/webhooks/{provider}` — a `paid` event deposits the
/// request's atomic amount into the owner's account.
pub async fn payment_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(body): Json<WebhookBody>,
) -> ApiResult<Json<WebhookResponse>> {
    if !state.features.payments_enabled {
        return Err(ApiError::FeatureDisabled("payments"));
    }

    match body.status.as_str() {
        "paid" => {
            let record = state
                .storage
                .transition_payment(&body.request_id, PaymentState::Pending, PaymentState::Paid)
                .await
                .map_err(|e| match e {
                    ainp_storage::StorageError::InvariantViolation(what) => {
                        ApiError::Conflict(what)
                    }
                    other => other.into(),
                })?;

            state.ledger.create_account(&record.owner_did, 0).await?;
            state
                .ledger
                .deposit(
                    &record.owner_did,
                    record.amount_atomic,
                    Some(&record.id),
                )
                .await?;
            tracing::info!(
                provider,
                request = %record.id,
                owner = %record.owner_did,
                amount = record.amount_atomic,
                "payment confirmed and deposited"
            );
            Ok(Json(WebhookResponse {
                status: "processed".to_string(),
            }))
        }
        "failed" => {
            state
                .storage
                .transition_payment(&body.request_id, PaymentState::Pending, PaymentState::Failed)
                .await?;
            Ok(Json(WebhookResponse {
                status: "processed".to_string(),
            }))
        }
        other => Err(ApiError::Validation(format!(
            "unknown webhook status: {other}"
        ))),
    }
}
