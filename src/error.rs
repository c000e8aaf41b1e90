//! Error taxonomy shared by every messaging operation.

use crate::crypto::CryptoError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use sea_orm::DbErr;

/// Operation errors, surfaced to callers.
///
/// `Unauthorized`, `Forbidden`, `NotFound` and `InvalidState` indicate a
/// caller-side mistake or a stale view and are never retried. `Authentication`
/// is uniform: it does not say whether the secret was wrong or the stored
/// data was corrupted. `TransientIo` means the primary store write failed and
/// nothing was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// No valid caller identity
    Unauthorized,
    /// Valid identity, but not an active participant
    Forbidden,
    /// Conversation or message absent
    NotFound,
    /// Operation does not apply to the record's current state
    InvalidState(String),
    /// Wrong secret or tampered ciphertext
    Authentication,
    /// Store unavailable
    TransientIo(String),
}

pub type MessagingResult<T> = Result<T, MessagingError>;

impl std::fmt::Display for MessagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessagingError::Unauthorized => write!(f, "Login required"),
            MessagingError::Forbidden => {
                write!(f, "You are not a participant in this conversation")
            }
            MessagingError::NotFound => write!(f, "Not found"),
            MessagingError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            MessagingError::Authentication => write!(f, "cannot decrypt message"),
            MessagingError::TransientIo(msg) => write!(f, "Storage unavailable: {}", msg),
        }
    }
}

impl std::error::Error for MessagingError {}

impl From<DbErr> for MessagingError {
    fn from(e: DbErr) -> Self {
        MessagingError::TransientIo(e.to_string())
    }
}

impl From<CryptoError> for MessagingError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Authentication => MessagingError::Authentication,
            other => {
                log::error!("Message sealing failed: {}", other);
                MessagingError::InvalidState("message could not be sealed".to_string())
            }
        }
    }
}

impl ResponseError for MessagingError {
    fn status_code(&self) -> StatusCode {
        match self {
            MessagingError::Unauthorized => StatusCode::UNAUTHORIZED,
            MessagingError::Forbidden => StatusCode::FORBIDDEN,
            MessagingError::NotFound => StatusCode::NOT_FOUND,
            MessagingError::InvalidState(_) => StatusCode::CONFLICT,
            MessagingError::Authentication => StatusCode::UNPROCESSABLE_ENTITY,
            MessagingError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Storage details stay in the log
        let message = match self {
            MessagingError::TransientIo(detail) => {
                log::error!("Store failure: {}", detail);
                "message not sent, retry".to_string()
            }
            other => other.to_string(),
        };

        HttpResponse::build(self.status_code()).json(serde_json::json!({ "error": message }))
    }
}
