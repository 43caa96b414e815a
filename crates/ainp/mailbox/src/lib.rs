//! Mailbox, thread, and contacts services.
//!
//! The mailbox persists one copy of an envelope per recipient and keeps the
//! thread aggregate exact; reads are ACL-scoped to the owning recipient.
//! Contacts track `(owner, peer)` edges with consent, which the anti-fraud
//! greylist consults on first contact.

#![deny(unsafe_code)]

mod contacts;

pub use contacts::ContactService;

use ainp_storage::{
    InboxCursor, InboxQuery, MailboxStore, MessageRecord, QueryWindow, StorageError,
    StoreOutcome, ThreadRecord,
};
use ainp_types::{Did, Envelope};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Hard cap on one inbox page.
pub const INBOX_LIMIT_MAX: usize = 200;
const INBOX_LIMIT_DEFAULT: usize = 50;

/// Result type for mailbox operations.
pub type MailboxResult<T> = Result<T, MailboxError>;

/// Inbox listing request with an opaque keyset cursor.
#[derive(Clone, Debug, Default)]
pub struct InboxRequest {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub label: Option<String>,
    pub unread_only: bool,
}

/// One inbox page plus the cursor for the next one.
#[derive(Clone, Debug)]
pub struct InboxPage {
    pub messages: Vec<MessageRecord>,
    pub next_cursor: Option<String>,
}

/// A thread with its messages, returned after the ACL check passed.
#[derive(Clone, Debug)]
pub struct ThreadView {
    pub thread: ThreadRecord,
    pub messages: Vec<MessageRecord>,
}

/// The mailbox service.
pub struct MailboxService {
    storage: Arc<dyn MailboxStore>,
}

impl MailboxService {
    pub fn new(storage: Arc<dyn MailboxStore>) -> Self {
        Self { storage }
    }

    /// Persist the owner's copy of an envelope. Idempotent on
    /// `(owner, envelope.id)`; the thread aggregate moves in the same
    /// transaction.
    pub async fn store_envelope(
        &self,
        envelope: &Envelope,
        owner: &Did,
    ) -> MailboxResult<(MessageRecord, StoreOutcome)> {
        let record = MessageRecord {
            id: Uuid::new_v4(),
            owner_did: owner.clone(),
            envelope_id: envelope.id.0.clone(),
            from_did: envelope.from_did.clone(),
            conversation_id: envelope.conversation_id().to_string(),
            msg_type: envelope.msg_type,
            payload: envelope.payload.clone(),
            read: false,
            labels: Vec::new(),
            created_at: chrono::Utc::now(),
        };
        let outcome = self.storage.store_message(record.clone()).await?;
        Ok((record, outcome))
    }

    /// Keyset-paginated inbox, newest first.
    pub async fn list_inbox(&self, owner: &Did, request: InboxRequest) -> MailboxResult<InboxPage> {
        let limit = request
            .limit
            .unwrap_or(INBOX_LIMIT_DEFAULT)
            .clamp(1, INBOX_LIMIT_MAX);
        let cursor = request.cursor.as_deref().map(parse_cursor).transpose()?;

        let messages = self
            .storage
            .list_inbox(
                owner,
                InboxQuery {
                    limit,
                    cursor,
                    label: request.label,
                    unread_only: request.unread_only,
                },
            )
            .await?;

        let next_cursor = if messages.len() == limit {
            messages.last().map(encode_cursor)
        } else {
            None
        };
        Ok(InboxPage {
            messages,
            next_cursor,
        })
    }

    /// Thread view for its owner. Anyone else gets `AccessDenied`; absence
    /// is indistinguishable from denial on purpose.
    pub async fn get_thread(
        &self,
        owner: &Did,
        conversation_id: &str,
    ) -> MailboxResult<ThreadView> {
        let thread = self
            .storage
            .get_thread(owner, conversation_id)
            .await?
            .ok_or_else(|| MailboxError::AccessDenied(conversation_id.to_string()))?;

        if !thread.participants.contains(owner) {
            return Err(MailboxError::AccessDenied(conversation_id.to_string()));
        }

        let messages = self
            .storage
            .list_thread_messages(owner, conversation_id, QueryWindow::default())
            .await?;
        Ok(ThreadView { thread, messages })
    }

    /// Idempotent read-flag update.
    pub async fn mark_read(
        &self,
        owner: &Did,
        message_id: &Uuid,
        read: bool,
    ) -> MailboxResult<MessageRecord> {
        Ok(self.storage.set_read(owner, message_id, read).await?)
    }

    /// Label set union/difference. Both lists empty is a caller error.
    pub async fn label(
        &self,
        owner: &Did,
        message_id: &Uuid,
        add: &[String],
        remove: &[String],
    ) -> MailboxResult<MessageRecord> {
        if add.is_empty() && remove.is_empty() {
            return Err(MailboxError::NoLabels);
        }
        Ok(self
            .storage
            .update_labels(owner, message_id, add, remove)
            .await?)
    }
}

fn encode_cursor(message: &MessageRecord) -> String {
    format!("{}:{}", message.created_at.timestamp_millis(), message.id)
}

fn parse_cursor(raw: &str) -> MailboxResult<InboxCursor> {
    let (millis, id) = raw
        .split_once(':')
        .ok_or_else(|| MailboxError::InvalidCursor(raw.to_string()))?;
    let millis: i64 = millis
        .parse()
        .map_err(|_| MailboxError::InvalidCursor(raw.to_string()))?;
    let created_at = chrono::DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| MailboxError::InvalidCursor(raw.to_string()))?;
    let id = Uuid::parse_str(id).map_err(|_| MailboxError::InvalidCursor(raw.to_string()))?;
    Ok(InboxCursor { created_at, id })
}

/// Mailbox errors.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("access denied to conversation {0}")]
    AccessDenied(String),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("label update requires at least one add or remove")]
    NoLabels,

    #[error("invalid pagination cursor: {0}")]
    InvalidCursor(String),

    #[error("mailbox backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for MailboxError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(what) => Self::NotFound(what),
            other => Self::Backend(other.to_string()),
        }
    }
}
