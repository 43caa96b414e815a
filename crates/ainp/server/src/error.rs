//! Error types for the broker daemon.
//!
//! `ApiError` is the single HTTP-facing taxonomy; every engine error maps
//! into it so handlers can use `?` and never leak internals. Challenge
//! headers (402/425/429) are attached here.

use ainp_crypto::ValidationError;
use ainp_discovery::DiscoveryError;
use ainp_guard::GuardError;
use ainp_ledger::LedgerError;
use ainp_mailbox::MailboxError;
use ainp_negotiation::NegotiationError;
use ainp_reputation::ReputationError;
use ainp_router::RouterError;
use ainp_usefulness::UsefulnessError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP-facing errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("negotiation expired")]
    Gone,

    #[error("greylisted: first contact requires consent or postage")]
    Greylisted { retry_after_secs: u64 },

    #[error("rate limited")]
    RateLimited { reset_at_ms: i64 },

    #[error("payment required")]
    PaymentRequired {
        request_id: String,
        method: String,
        payment_url: Option<String>,
    },

    #[error("feature disabled: {0}")]
    FeatureDisabled(&'static str),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("internal error")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ApiError {
    fn code(&self) -> (&'static str, StatusCode) {
        match self {
            Self::Validation(_) => ("VALIDATION", StatusCode::BAD_REQUEST),
            Self::Authentication(_) => ("AUTHENTICATION", StatusCode::UNAUTHORIZED),
            Self::Authorization(_) => ("AUTHORIZATION", StatusCode::FORBIDDEN),
            Self::NotFound(_) => ("NOT_FOUND", StatusCode::NOT_FOUND),
            Self::Conflict(_) => ("CONFLICT", StatusCode::CONFLICT),
            Self::Gone => ("GONE", StatusCode::GONE),
            Self::Greylisted { .. } => ("GREYLISTED", StatusCode::TOO_EARLY),
            Self::RateLimited { .. } => ("RATE_LIMITED", StatusCode::TOO_MANY_REQUESTS),
            Self::PaymentRequired { .. } => ("PAYMENT_REQUIRED", StatusCode::PAYMENT_REQUIRED),
            Self::FeatureDisabled(_) => ("FEATURE_DISABLED", StatusCode::SERVICE_UNAVAILABLE),
            Self::DependencyUnavailable(_) => {
                ("DEPENDENCY_UNAVAILABLE", StatusCode::SERVICE_UNAVAILABLE)
            }
            Self::Internal(_) => ("INTERNAL", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.code();
        let message = match &self {
            // Internal detail stays in the log, not the response.
            Self::Internal(detail) => {
                tracing::error!(%detail, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: code.to_string(),
            message,
        };
        let mut response = (status, Json(body)).into_response();

        match &self {
            Self::Greylisted { retry_after_secs } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            Self::RateLimited { reset_at_ms } => {
                let now = chrono::Utc::now().timestamp_millis();
                let retry_secs = ((reset_at_ms - now).max(0) / 1000).max(1);
                if let Ok(value) = HeaderValue::from_str(&retry_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                if let Ok(value) = HeaderValue::from_str(&reset_at_ms.to_string()) {
                    response.headers_mut().insert("X-RateLimit-Reset", value);
                }
            }
            Self::PaymentRequired {
                request_id,
                method,
                payment_url,
            } => {
                let challenge = format!(
                    "AINP-Pay realm=\"ainp\", request_id=\"{request_id}\", method=\"{method}\""
                );
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
                }
                if let Some(url) = payment_url {
                    if let Ok(value) = HeaderValue::from_str(&format!("<{url}>; rel=\"payment\"")) {
                        response.headers_mut().insert(header::LINK, value);
                    }
                }
            }
            _ => {}
        }

        response
    }
}

impl From<ValidationError> for ApiError {
    fn from(value: ValidationError) -> Self {
        match value {
            ValidationError::SignatureInvalid
            | ValidationError::UnknownSender(_)
            | ValidationError::DidMismatch { .. } => Self::Authentication(value.to_string()),
            ValidationError::Expired => Self::Validation("envelope expired".to_string()),
            ValidationError::ResolverUnavailable(detail) => Self::DependencyUnavailable(detail),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<GuardError> for ApiError {
    fn from(value: GuardError) -> Self {
        match value {
            GuardError::DuplicateEnvelope(_) | GuardError::DuplicateContent => {
                Self::Conflict(value.to_string())
            }
            GuardError::Greylisted { retry_after_secs } => {
                Self::Greylisted { retry_after_secs }
            }
            GuardError::SenderBlocked => Self::Authorization(value.to_string()),
            GuardError::PostageRequired { .. } => Self::PaymentRequired {
                request_id: String::new(),
                method: "credits".to_string(),
                payment_url: None,
            },
            GuardError::PostageDisabled => Self::FeatureDisabled("greylist_bypass_payment"),
            GuardError::Backend(detail) => Self::Internal(detail),
        }
    }
}

impl From<RouterError> for ApiError {
    fn from(value: RouterError) -> Self {
        match value {
            RouterError::Validation(e) => e.into(),
            RouterError::Guard(e) => e.into(),
            RouterError::RateLimited { reset_at_ms } => Self::RateLimited { reset_at_ms },
            RouterError::Discovery(e) => e.into(),
            RouterError::PublishFailed(detail) => Self::DependencyUnavailable(detail),
            RouterError::Backend(detail) => Self::Internal(detail),
        }
    }
}

impl From<DiscoveryError> for ApiError {
    fn from(value: DiscoveryError) -> Self {
        match value {
            DiscoveryError::InvalidQuery(detail) => Self::Validation(detail),
            DiscoveryError::EmbeddingUnavailable(detail) => Self::DependencyUnavailable(detail),
            DiscoveryError::Backend(detail) => Self::Internal(detail),
        }
    }
}

impl From<MailboxError> for ApiError {
    fn from(value: MailboxError) -> Self {
        match value {
            MailboxError::AccessDenied(_) => Self::Authorization(value.to_string()),
            MailboxError::NotFound(what) => Self::NotFound(what),
            MailboxError::NoLabels | MailboxError::InvalidCursor(_) => {
                Self::Validation(value.to_string())
            }
            MailboxError::Backend(detail) => Self::Internal(detail),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::AccountNotFound(did) => Self::NotFound(format!("account {did}")),
            LedgerError::InsufficientBalance { .. }
            | LedgerError::InsufficientReserved { .. } => Self::Conflict(value.to_string()),
            LedgerError::InvalidAmount(_) | LedgerError::InvalidSplit(_) => {
                Self::Validation(value.to_string())
            }
            LedgerError::Backend(detail) => Self::Internal(detail),
        }
    }
}

impl From<NegotiationError> for ApiError {
    fn from(value: NegotiationError) -> Self {
        match value {
            NegotiationError::NotFound(what) => Self::NotFound(what),
            NegotiationError::ExpiredNegotiation => Self::Gone,
            NegotiationError::NotParticipant(_) => Self::Authorization(value.to_string()),
            NegotiationError::InvalidParticipants
            | NegotiationError::InvalidMaxRounds(_)
            | NegotiationError::InvalidSplit(_) => Self::Validation(value.to_string()),
            NegotiationError::MaxRoundsExceeded { .. }
            | NegotiationError::InvalidStateTransition(_)
            | NegotiationError::NothingToAccept
            | NegotiationError::InsufficientCredits { .. } => Self::Conflict(value.to_string()),
            NegotiationError::ReservationFailed(detail)
            | NegotiationError::Backend(detail) => Self::Internal(detail),
        }
    }
}

impl From<UsefulnessError> for ApiError {
    fn from(value: UsefulnessError) -> Self {
        match value {
            UsefulnessError::InvalidProof(_) => Self::Validation(value.to_string()),
            UsefulnessError::Duplicate(what) => Self::Conflict(what),
            UsefulnessError::Backend(detail) => Self::Internal(detail),
        }
    }
}

impl From<ReputationError> for ApiError {
    fn from(value: ReputationError) -> Self {
        match value {
            ReputationError::NotFound(what) => Self::NotFound(what),
            ReputationError::NotACommitteeMember(_) => Self::Authorization(value.to_string()),
            ReputationError::Conflict(what) => Self::Conflict(what),
            ReputationError::Backend(detail) => Self::Internal(detail),
        }
    }
}

impl From<ainp_storage::StorageError> for ApiError {
    fn from(value: ainp_storage::StorageError) -> Self {
        match value {
            ainp_storage::StorageError::NotFound(what) => Self::NotFound(what),
            ainp_storage::StorageError::Conflict(what) => Self::Conflict(what),
            ainp_storage::StorageError::InvalidInput(what) => Self::Validation(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Validation("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Authentication("x".into()).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Gone.into_response().status(), StatusCode::GONE);
        assert_eq!(
            ApiError::Greylisted {
                retry_after_secs: 60
            }
            .into_response()
            .status(),
            StatusCode::TOO_EARLY
        );
        assert_eq!(
            ApiError::FeatureDisabled("messaging").into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn greylist_carries_retry_after() {
        let response = ApiError::Greylisted {
            retry_after_secs: 60,
        }
        .into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "60"
        );
    }

    #[test]
    fn payment_required_carries_the_challenge() {
        let response = ApiError::PaymentRequired {
            request_id: "req-1".to_string(),
            method: "lightning".to_string(),
            payment_url: Some("https://pay.example/req-1".to_string()),
        }
        .into_response();
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(challenge.starts_with("AINP-Pay realm=\"ainp\""));
        assert!(challenge.contains("request_id=\"req-1\""));
        assert!(response.headers().get(header::LINK).is_some());
    }
}
