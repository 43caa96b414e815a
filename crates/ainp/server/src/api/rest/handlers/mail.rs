//! Mailbox reads and flag/label updates, all scoped to the caller.

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use ainp_mailbox::{InboxRequest, ThreadView};
use ainp_storage::MessageRecord;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct InboxParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub unread_only: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct InboxResponse {
    pub messages: Vec<MessageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `GET /api/mail/inbox`
pub async fn list_inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<InboxParams>,
) -> ApiResult<Json<InboxResponse>> {
    if !state.features.messaging_enabled {
        return Err(ApiError::FeatureDisabled("messaging"));
    }
    let caller = state.caller(&headers)?;

    let page = state
        .mailbox
        .list_inbox(
            &caller,
            InboxRequest {
                limit: params.limit,
                cursor: params.cursor,
                label: params.label,
                unread_only: params.unread_only.unwrap_or(false),
            },
        )
        .await?;
    Ok(Json(InboxResponse {
        messages: page.messages,
        next_cursor: page.next_cursor,
    }))
}

#[derive(Debug, Serialize)]
pub struct ThreadResponse {
    pub conversation_id: String,
    pub participants: Vec<ainp_types::Did>,
    pub message_count: i64,
    pub unread_count: i64,
    pub last_message_at: chrono::DateTime<chrono::Utc>,
    pub messages: Vec<MessageRecord>,
}

impl From<ThreadView> for ThreadResponse {
    fn from(view: ThreadView) -> Self {
        Self {
            conversation_id: view.thread.conversation_id,
            participants: view.thread.participants,
            message_count: view.thread.message_count,
            unread_count: view.thread.unread_count,
            last_message_at: view.thread.last_message_at,
            messages: view.messages,
        }
    }
}

/// `GET /api/mail/threads/{conversation_id}`
pub async fn get_thread(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ThreadResponse>> {
    if !state.features.messaging_enabled {
        return Err(ApiError::FeatureDisabled("messaging"));
    }
    let caller = state.caller(&headers)?;
    let view = state.mailbox.get_thread(&caller, &conversation_id).await?;
    Ok(Json(view.into()))
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub message_id: Uuid,
    #[serde(default = "default_read")]
    pub read: bool,
}

fn default_read() -> bool {
    true
}

/// `POST /api/mail/read` — idempotent.
pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<MarkReadRequest>,
) -> ApiResult<Json<MessageRecord>> {
    if !state.features.messaging_enabled {
        return Err(ApiError::FeatureDisabled("messaging"));
    }
    let caller = state.caller(&headers)?;
    let message = state
        .mailbox
        .mark_read(&caller, &request.message_id, request.read)
        .await?;
    Ok(Json(message))
}

#[derive(Debug, Deserialize)]
pub struct LabelRequest {
    pub message_id: Uuid,
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// `POST /api/mail/label` — set union/difference; both lists empty is a
/// validation error.
pub async fn label_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LabelRequest>,
) -> ApiResult<Json<MessageRecord>> {
    if !state.features.messaging_enabled {
        return Err(ApiError::FeatureDisabled("messaging"));
    }
    let caller = state.caller(&headers)?;
    let message = state
        .mailbox
        .label(&caller, &request.message_id, &request.add, &request.remove)
        .await?;
    Ok(Json(message))
}
